//! Latent-function inference engines.
//!
//! The strategy is selected once at construction: a Gaussian likelihood with
//! the identity link admits exact conditioning, any other link goes through
//! the Laplace approximation (Gaussian expansion at the posterior mode).
//! Both engines expose the (approximate) log marginal likelihood used as the
//! hyperparameter optimization objective and the posterior mean/variance at
//! new points.

use crate::errors::{GpError, Result};
use crate::kernel::RbfKernel;
use crate::likelihood::GaussianLikelihood;
use crate::utils::cholesky_with_jitter;
use linfa_linalg::{cholesky::*, triangular::*};
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix2};
use std::fmt;

/// Newton iteration cap for the Laplace mode search
pub const LAPLACE_MAX_ITER: usize = 30;
/// Step-norm tolerance per training point for the Laplace mode search
pub const LAPLACE_STEP_TOL: f64 = 1e-9;

// The B = I + W^1/2 K W^1/2 form needs a nonnegative curvature matrix; the
// Gaussian-through-link likelihood is not globally log-concave, so the
// curvature is floored.
const W_FLOOR: f64 = 1e-10;

/// Inference strategy tag, chosen once at model construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InferenceMethod {
    /// Closed-form Gaussian conditioning (identity link only)
    ExactGaussian,
    /// Gaussian approximation of the posterior at its mode
    Laplace,
}

impl fmt::Display for InferenceMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InferenceMethod::ExactGaussian => write!(f, "ExactGaussian"),
            InferenceMethod::Laplace => write!(f, "Laplace"),
        }
    }
}

/// Fitted state of the exact engine, retained for predictions.
#[derive(Clone, Debug)]
pub(crate) struct ExactState {
    /// Cholesky factor of K + noise_variance * I
    pub l_chol: Array2<f64>,
    /// (K + noise_variance * I)^-1 y, shape (n, 1)
    pub alpha: Array2<f64>,
}

/// Fitted state of the Laplace engine, retained for predictions.
#[derive(Clone, Debug)]
pub(crate) struct LaplaceState {
    /// Posterior mode of the latent values
    pub f_mode: Array1<f64>,
    /// Likelihood gradient at the mode
    pub grad_ll: Array1<f64>,
    /// Square root of the floored negative likelihood curvature at the mode
    pub w_sqrt: Array1<f64>,
    /// Cholesky factor of B = I + W^1/2 K W^1/2
    pub b_chol: Array2<f64>,
    /// Whether the Newton iteration met its tolerance within the cap
    pub converged: bool,
    /// Number of Newton iterations run
    pub n_iter: usize,
}

/// Fitted inference state, one variant per strategy.
#[derive(Clone, Debug)]
pub(crate) enum InnerState {
    Exact(ExactState),
    Laplace(LaplaceState),
}

/// Exact log marginal likelihood of a Gaussian-noise identity-link model:
/// log p(Y|X) = -1/2 y^T Ky^-1 y - 1/2 log|Ky| - n/2 log(2 pi)
/// with Ky = K + noise_variance * I, computed through a Cholesky
/// factorization. When `want_grad` is set, also returns the gradient with
/// respect to the natural log of each hyperparameter, ordered
/// [variance, lengthscale_1..lengthscale_d, noise_variance].
pub(crate) fn exact_log_marginal(
    kernel: &RbfKernel,
    noise_variance: f64,
    x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    y: &Array2<f64>,
    nugget: f64,
    want_grad: bool,
) -> Result<(f64, Option<Array1<f64>>, ExactState)> {
    let n = x.nrows();
    let k = kernel.value(x, x);
    let mut ky = k.to_owned();
    ky.diag_mut()
        .mapv_inplace(|v| v + noise_variance + nugget * kernel.variance());
    let l_chol = cholesky_with_jitter(&ky, nugget)?;

    let z = l_chol.solve_triangular(y, UPLO::Lower)?;
    let alpha = l_chol.t().solve_triangular(&z, UPLO::Upper)?;

    let yt_alpha = (y * &alpha).sum();
    let half_logdet: f64 = l_chol.diag().mapv(f64::ln).sum();
    let lml = -0.5 * yt_alpha
        - half_logdet
        - 0.5 * n as f64 * (2. * std::f64::consts::PI).ln();
    if !lml.is_finite() {
        return Err(GpError::LikelihoodComputationError(
            "non-finite exact marginal likelihood".to_string(),
        ));
    }

    let grad = if want_grad {
        // d logZ / d theta_j = 1/2 tr((alpha alpha^T - Ky^-1) dKy/dtheta_j)
        let eye = Array2::eye(n);
        let zi = l_chol.solve_triangular(&eye, UPLO::Lower)?;
        let ky_inv = l_chol.t().solve_triangular(&zi, UPLO::Upper)?;
        let a_mat = alpha.dot(&alpha.t()) - ky_inv;

        let dim = kernel.dim();
        let mut g = Array1::zeros(dim + 2);
        // dKy/d ln(variance) = K + nugget * variance * I
        g[0] = 0.5 * (&a_mat * &kernel.grad_ln_variance(&k)).sum()
            + 0.5 * nugget * kernel.variance() * a_mat.diag().sum();
        for d in 0..dim {
            g[d + 1] = 0.5 * (&a_mat * &kernel.grad_ln_lengthscale(x, &k, d)).sum();
        }
        // dKy/d ln(noise_variance) = noise_variance * I
        g[dim + 1] = 0.5 * noise_variance * a_mat.diag().sum();
        Some(g)
    } else {
        None
    };

    Ok((lml, grad, ExactState { l_chol, alpha }))
}

/// Laplace approximation of the log marginal likelihood.
///
/// The posterior mode is found by the stabilized Newton iteration on the
/// latent vector (B-matrix formulation), then the marginal likelihood adds
/// the log-determinant correction to the joint density at the mode:
/// log q(Y|X) = -1/2 a^T f - sum_i log L_ii + log p(Y|f).
/// Non-convergence within the iteration cap is recorded in the returned
/// state, not hidden.
pub(crate) fn laplace_log_marginal(
    kernel: &RbfKernel,
    lik: &GaussianLikelihood,
    x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    y: &Array1<f64>,
    nugget: f64,
    max_iter: usize,
) -> Result<(f64, LaplaceState)> {
    let n = x.nrows();
    let mut k = kernel.value(x, x);
    k.diag_mut()
        .mapv_inplace(|v| v + nugget * kernel.variance());

    let mut f: Array1<f64> = Array1::zeros(n);
    let mut a: Array1<f64> = Array1::zeros(n);
    let mut converged = false;
    let mut n_iter = max_iter;
    let tol = LAPLACE_STEP_TOL * n as f64;

    for iter in 0..max_iter {
        let (_, grad, hess) = lik.eval(y, &f);
        let w = hess.mapv(|h| (-h).max(W_FLOOR));
        let w_sqrt = w.mapv(f64::sqrt);
        let l_chol = b_matrix(&k, &w_sqrt).cholesky()?;

        let b = &w * &f + &grad;
        let kb = k.dot(&b);
        let rhs = (&w_sqrt * &kb).insert_axis(Axis(1));
        let s = l_chol.solve_triangular(&rhs, UPLO::Lower)?;
        let s = l_chol.t().solve_triangular(&s, UPLO::Upper)?;
        a = b - &w_sqrt * &s.remove_axis(Axis(1));
        let f_new = k.dot(&a);

        let step = (&f_new - &f).mapv(|v| v * v).sum().sqrt();
        f = f_new;
        if step < tol {
            converged = true;
            n_iter = iter + 1;
            break;
        }
    }

    // Recompute curvature and factorization at the final latent values
    let (ll, grad_ll, hess) = lik.eval(y, &f);
    let w = hess.mapv(|h| (-h).max(W_FLOOR));
    let w_sqrt = w.mapv(f64::sqrt);
    let b_chol = b_matrix(&k, &w_sqrt).cholesky()?;

    let lml = -0.5 * a.dot(&f) + ll - b_chol.diag().mapv(f64::ln).sum();
    if !lml.is_finite() {
        return Err(GpError::LikelihoodComputationError(
            "non-finite Laplace marginal likelihood".to_string(),
        ));
    }

    Ok((
        lml,
        LaplaceState {
            f_mode: f,
            grad_ll,
            w_sqrt,
            b_chol,
            converged,
            n_iter,
        },
    ))
}

/// B = I + W^1/2 K W^1/2
fn b_matrix(k: &Array2<f64>, w_sqrt: &Array1<f64>) -> Array2<f64> {
    let n = k.nrows();
    let mut b = Array2::eye(n);
    for i in 0..n {
        for j in 0..n {
            b[[i, j]] += w_sqrt[i] * k[[i, j]] * w_sqrt[j];
        }
    }
    b
}

/// Cross covariance to the training set and its whitened triangular solve,
/// the shared ingredients of the predictive variance and covariance.
fn cross_weights(
    kernel: &RbfKernel,
    x_train: &Array2<f64>,
    inner: &InnerState,
    xnew: &ArrayBase<impl Data<Elem = f64>, Ix2>,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let ks = kernel.value(x_train, xnew);
    let v = match inner {
        InnerState::Exact(state) => state.l_chol.solve_triangular(&ks, UPLO::Lower)?,
        InnerState::Laplace(state) => {
            let scaled = &ks * &state.w_sqrt.view().insert_axis(Axis(1));
            state.b_chol.solve_triangular(&scaled, UPLO::Lower)?
        }
    };
    Ok((ks, v))
}

/// Posterior latent mean at `xnew` (shared by variance and covariance paths)
fn posterior_mean(ks: &Array2<f64>, inner: &InnerState) -> Array1<f64> {
    match inner {
        InnerState::Exact(state) => ks.t().dot(&state.alpha).column(0).to_owned(),
        InnerState::Laplace(state) => ks.t().dot(&state.grad_ll),
    }
}

/// Noiseless posterior mean and per-point variance of the latent function.
pub(crate) fn posterior_mean_var(
    kernel: &RbfKernel,
    x_train: &Array2<f64>,
    inner: &InnerState,
    xnew: &ArrayBase<impl Data<Elem = f64>, Ix2>,
) -> Result<(Array1<f64>, Array1<f64>)> {
    let (ks, v) = cross_weights(kernel, x_train, inner, xnew)?;
    let mean = posterior_mean(&ks, inner);
    let mut var =
        Array1::from_elem(xnew.nrows(), kernel.variance()) - v.mapv(|x| x * x).sum_axis(Axis(0));
    // variance might be slightly negative depending on machine precision:
    // set to zero in that case
    var.mapv_inplace(|x| if x < 0. { 0. } else { x });
    Ok((mean, var))
}

/// Noiseless posterior mean and full covariance of the latent function.
pub(crate) fn posterior_mean_cov(
    kernel: &RbfKernel,
    x_train: &Array2<f64>,
    inner: &InnerState,
    xnew: &ArrayBase<impl Data<Elem = f64>, Ix2>,
) -> Result<(Array1<f64>, Array2<f64>)> {
    let (ks, v) = cross_weights(kernel, x_train, inner, xnew)?;
    let mean = posterior_mean(&ks, inner);
    let cov = kernel.value(xnew, xnew) - v.t().dot(&v);
    Ok((mean, cov))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::Link;
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use ndarray::{array, Axis};

    fn toy_data() -> (Array2<f64>, Array1<f64>) {
        (
            array![[0., 1.], [1., 2.], [2., 3.], [3., 4.5]],
            array![0.1, 0.9, 2.0, 3.1],
        )
    }

    #[test]
    fn test_exact_gradient_matches_finite_diff() {
        let (x, y) = toy_data();
        let ycol = y.to_owned().insert_axis(Axis(1));
        let theta_ln = vec![0.3f64, -0.2, 0.4, -1.0]; // ln of [var, l1, l2, noise]
        let value = |p: &Vec<f64>| {
            let mut kernel = RbfKernel::new(2).unwrap();
            kernel.set_hyperparams(p[0].exp(), &array![p[1].exp(), p[2].exp()]);
            let (lml, _, _) =
                exact_log_marginal(&kernel, p[3].exp(), &x, &ycol, 0., false).unwrap();
            lml
        };
        let num = theta_ln.central_diff(&value);

        let mut kernel = RbfKernel::new(2).unwrap();
        kernel.set_hyperparams(
            theta_ln[0].exp(),
            &array![theta_ln[1].exp(), theta_ln[2].exp()],
        );
        let (_, grad, _) =
            exact_log_marginal(&kernel, theta_ln[3].exp(), &x, &ycol, 0., true).unwrap();
        let grad = grad.unwrap();
        for j in 0..4 {
            assert_abs_diff_eq!(grad[j], num[j], epsilon = 1e-5);
        }
    }

    #[test]
    fn test_exact_gradient_matches_finite_diff_with_large_nugget() {
        // The diagonal loading scales with the variance, so it contributes
        // to the ln(variance) gradient entry once the nugget is not tiny
        let (x, y) = toy_data();
        let ycol = y.to_owned().insert_axis(Axis(1));
        let nugget = 1e-2;
        let theta_ln = vec![0.3f64, -0.2, 0.4, -1.0];
        let value = |p: &Vec<f64>| {
            let mut kernel = RbfKernel::new(2).unwrap();
            kernel.set_hyperparams(p[0].exp(), &array![p[1].exp(), p[2].exp()]);
            let (lml, _, _) =
                exact_log_marginal(&kernel, p[3].exp(), &x, &ycol, nugget, false).unwrap();
            lml
        };
        let num = theta_ln.central_diff(&value);

        let mut kernel = RbfKernel::new(2).unwrap();
        kernel.set_hyperparams(
            theta_ln[0].exp(),
            &array![theta_ln[1].exp(), theta_ln[2].exp()],
        );
        let (_, grad, _) =
            exact_log_marginal(&kernel, theta_ln[3].exp(), &x, &ycol, nugget, true).unwrap();
        let grad = grad.unwrap();
        for j in 0..4 {
            assert_abs_diff_eq!(grad[j], num[j], epsilon = 1e-5);
        }
    }

    #[test]
    fn test_laplace_iteration_cap_reported() {
        let x = array![[0.], [1.], [2.], [3.], [4.]];
        let y = array![0.05, 0.2, 0.5, 0.8, 0.95];
        let mut kernel = RbfKernel::new(1).unwrap();
        kernel.set_hyperparams(1., &array![1.5]);
        let lik = GaussianLikelihood::new(Link::Probit).with_variance(0.05);
        let (lml, state) = laplace_log_marginal(&kernel, &lik, &x, &y, 0., 1).unwrap();
        assert!(!state.converged);
        assert_eq!(state.n_iter, 1);
        assert!(lml.is_finite());
    }

    #[test]
    fn test_laplace_identity_recovers_exact() {
        // With the identity link the Laplace approximation is exact
        let (x, y) = toy_data();
        let ycol = y.to_owned().insert_axis(Axis(1));
        let mut kernel = RbfKernel::new(2).unwrap();
        kernel.set_hyperparams(1.4, &array![0.9, 1.6]);
        let lik = GaussianLikelihood::new(Link::Identity).with_variance(0.2);

        let (lml_exact, _, exact) = exact_log_marginal(&kernel, 0.2, &x, &ycol, 0., false).unwrap();
        let (lml_laplace, laplace) =
            laplace_log_marginal(&kernel, &lik, &x, &y, 0., LAPLACE_MAX_ITER).unwrap();
        assert!(laplace.converged);
        assert_abs_diff_eq!(lml_exact, lml_laplace, epsilon = 1e-8);

        let xnew = array![[0.5, 1.5], [2.5, 3.2]];
        let (m_e, v_e) =
            posterior_mean_var(&kernel, &x, &InnerState::Exact(exact), &xnew).unwrap();
        let (m_l, v_l) =
            posterior_mean_var(&kernel, &x, &InnerState::Laplace(laplace), &xnew).unwrap();
        assert_abs_diff_eq!(m_e, m_l, epsilon = 1e-7);
        assert_abs_diff_eq!(v_e, v_l, epsilon = 1e-7);
    }

    #[test]
    fn test_laplace_probit_converges() {
        let x = array![[0.], [1.], [2.], [3.], [4.]];
        let y = array![0.05, 0.2, 0.5, 0.8, 0.95];
        let mut kernel = RbfKernel::new(1).unwrap();
        kernel.set_hyperparams(1., &array![1.5]);
        let lik = GaussianLikelihood::new(Link::Probit).with_variance(0.05);
        let (lml, state) =
            laplace_log_marginal(&kernel, &lik, &x, &y, 0., LAPLACE_MAX_ITER).unwrap();
        assert!(state.converged, "Newton search should converge");
        assert!(lml.is_finite());
        assert!(state.f_mode.iter().all(|v| v.is_finite()));
        // mode maps into observation space close to the increasing trend
        assert!(lik.link().value(state.f_mode[4]) > lik.link().value(state.f_mode[0]));
    }

    #[test]
    fn test_posterior_variance_shrinks_at_training_points() {
        let (x, y) = toy_data();
        let ycol = y.to_owned().insert_axis(Axis(1));
        let mut kernel = RbfKernel::new(2).unwrap();
        kernel.set_hyperparams(1., &array![1., 1.]);
        let (_, _, state) = exact_log_marginal(&kernel, 1e-4, &x, &ycol, 0., false).unwrap();
        let inner = InnerState::Exact(state);
        let (_, var_train) = posterior_mean_var(&kernel, &x, &inner, &x).unwrap();
        let far = array![[10., -10.]];
        let (_, var_far) = posterior_mean_var(&kernel, &x, &inner, &far).unwrap();
        assert!(var_train.iter().all(|&v| v < 0.05));
        assert_abs_diff_eq!(var_far[0], 1., epsilon = 1e-3);
    }

    #[test]
    fn test_mean_cov_consistent_with_mean_var() {
        let (x, y) = toy_data();
        let ycol = y.to_owned().insert_axis(Axis(1));
        let mut kernel = RbfKernel::new(2).unwrap();
        kernel.set_hyperparams(1.2, &array![0.8, 1.1]);
        let (_, _, state) = exact_log_marginal(&kernel, 0.1, &x, &ycol, 0., false).unwrap();
        let inner = InnerState::Exact(state);
        let xnew = array![[0.3, 1.1], [1.7, 2.9], [2.4, 4.0]];
        let (m1, var) = posterior_mean_var(&kernel, &x, &inner, &xnew).unwrap();
        let (m2, cov) = posterior_mean_cov(&kernel, &x, &inner, &xnew).unwrap();
        assert_abs_diff_eq!(m1, m2, epsilon = 1e-10);
        for i in 0..3 {
            assert_abs_diff_eq!(var[i], cov[[i, i]].max(0.), epsilon = 1e-8);
        }
    }
}
