use ndarray::{arr1, Array1};
use slsqp::{minimize, Func, StopTols, SuccessStatus};

/// SLSQP stopping configuration
pub(crate) struct SlsqpParams {
    pub ftol_rel: f64,
    pub maxeval: usize,
}

impl Default for SlsqpParams {
    fn default() -> Self {
        SlsqpParams {
            ftol_rel: 1e-8,
            maxeval: 500,
        }
    }
}

/// Minimize the negated fitting objective over log10-scale hyperparameters
/// with the SLSQP gradient-based optimizer.
///
/// Returns the objective value, the last iterate and a convergence flag; on
/// a failure status the last iterate is kept so the caller can still produce
/// a usable fit.
pub(crate) fn optimize_params<ObjF>(
    objfn: ObjF,
    param0: &Array1<f64>,
    bounds: &[(f64, f64)],
    slsqp: SlsqpParams,
) -> (f64, Array1<f64>, bool)
where
    ObjF: Fn(&[f64], Option<&mut [f64]>, &mut ()) -> f64,
{
    let cons: Vec<&dyn Func<()>> = vec![];
    let param0 = param0.to_vec();

    match minimize(
        objfn,
        &param0,
        bounds,
        &cons,
        (),
        slsqp.maxeval,
        Some(StopTols {
            ftol_rel: slsqp.ftol_rel,
            ..StopTols::default()
        }),
    ) {
        Ok((status, x_opt, fval)) => {
            let fval = if f64::is_nan(fval) {
                f64::INFINITY
            } else {
                fval
            };
            // a cap-limited run is a usable iterate, not a converged one
            let converged = !matches!(
                status,
                SuccessStatus::MaxEvalReached | SuccessStatus::MaxTimeReached
            );
            if !converged {
                log::warn!("SLSQP optimizer stopped on its cap, status={status:?}");
            }
            (fval, arr1(&x_opt), converged)
        }
        Err((status, x_opt, fval)) => {
            log::warn!("SLSQP optimizer did not converge, status={status:?}");
            (fval, arr1(&x_opt), false)
        }
    }
}
