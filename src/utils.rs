use crate::errors::Result;
use linfa_linalg::cholesky::*;
use log::debug;
use ndarray::{Array2, ArrayBase, Data, Ix2};

/// Computes per-dimension squared deviations between each row of `xa` and each
/// row of `xb`, resulting in a 3-index layout flattened as a
/// (nrows(xa) * nrows(xb), ncols) array.
/// *Panics* if `xa` and `xb` have not the same column numbers
pub(crate) fn pairwise_sq_deviations(
    xa: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    xb: &ArrayBase<impl Data<Elem = f64>, Ix2>,
) -> Array2<f64> {
    assert!(xa.ncols() == xb.ncols());

    let na = xa.nrows();
    let nb = xb.nrows();
    let ncols = xa.ncols();
    let mut result = Array2::zeros((na * nb, ncols));

    for (i, a_row) in xa.rows().into_iter().enumerate() {
        for (j, b_row) in xb.rows().into_iter().enumerate() {
            let idx = i * nb + j;
            for k in 0..ncols {
                let d = a_row[k] - b_row[k];
                result[[idx, k]] = d * d;
            }
        }
    }

    result
}

/// Whether `x` contains at least two identical rows.
pub(crate) fn has_duplicate_rows(x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> bool {
    let n = x.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let dist: f64 = x
                .row(i)
                .iter()
                .zip(x.row(j).iter())
                .map(|(a, b)| (a - b).abs())
                .sum();
            if dist == 0. {
                return true;
            }
        }
    }
    false
}

/// Cholesky factorization with an escalating diagonal loading retry.
///
/// A degenerate hyperparameter set can make a covariance matrix numerically
/// non positive-definite; a small jitter on the diagonal, scaled from the
/// given `nugget`, is then tried a few times before the failure is escalated.
pub(crate) fn cholesky_with_jitter(m: &Array2<f64>, nugget: f64) -> Result<Array2<f64>> {
    if let Ok(l_chol) = m.cholesky() {
        return Ok(l_chol);
    }
    let scale = m.diag().iter().map(|v| v.abs()).fold(f64::MIN, f64::max).max(1.);
    let mut jitter = nugget.max(100. * f64::EPSILON) * scale;
    for _ in 0..4 {
        let mut loaded = m.to_owned();
        loaded.diag_mut().mapv_inplace(|v| v + jitter);
        if let Ok(l_chol) = loaded.cholesky() {
            debug!("Cholesky recovered with diagonal loading {jitter}");
            return Ok(l_chol);
        }
        jitter *= 10.;
    }
    Ok(m.cholesky()?)
}
