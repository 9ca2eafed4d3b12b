//! Automatic-relevance-determination RBF covariance:
//! k(x, x') = variance * exp(-1/2 sum_d (x_d - x'_d)^2 / lengthscale_d^2)
//!
//! The kernel owns its hyperparameters; each lengthscale can be fixed to a
//! caller-supplied constant and excluded from optimization, and a Gamma prior
//! can be attached to the variance and to each still-free lengthscale.

use crate::errors::{GpError, Result};
use crate::priors::GammaPrior;
use crate::utils::pairwise_sq_deviations;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use std::fmt;

/// ARD squared-exponential kernel with per-dimension lengthscales.
#[derive(Clone, Debug, PartialEq)]
pub struct RbfKernel {
    variance: f64,
    lengthscale: Array1<f64>,
    fixed: Vec<bool>,
    variance_prior: Option<GammaPrior>,
    lengthscale_prior: Option<GammaPrior>,
}

impl RbfKernel {
    /// Kernel over `dim`-dimensional inputs, unit variance and lengthscales.
    pub fn new(dim: usize) -> Result<RbfKernel> {
        if dim == 0 {
            return Err(GpError::InvalidValueError(
                "kernel input dimension cannot be 0".to_string(),
            ));
        }
        Ok(RbfKernel {
            variance: 1.,
            lengthscale: Array1::ones(dim),
            fixed: vec![false; dim],
            variance_prior: None,
            lengthscale_prior: None,
        })
    }

    /// Input dimension
    pub fn dim(&self) -> usize {
        self.lengthscale.len()
    }

    /// Process variance
    pub fn variance(&self) -> f64 {
        self.variance
    }

    /// Per-dimension lengthscales
    pub fn lengthscale(&self) -> &Array1<f64> {
        &self.lengthscale
    }

    /// Whether lengthscale `i` is locked to a constant
    pub fn is_fixed(&self, i: usize) -> bool {
        self.fixed[i]
    }

    /// Lock lengthscale `i` to `value` and exclude it from optimization.
    pub fn fix_lengthscale(&mut self, i: usize, value: f64) -> Result<()> {
        if i >= self.dim() {
            return Err(GpError::ShapeError(format!(
                "lengthscale index {i} out of range for dimension {}",
                self.dim()
            )));
        }
        if !(value > 0. && value.is_finite()) {
            return Err(GpError::InvalidValueError(format!(
                "fixed lengthscale must be a positive finite value, got {value}"
            )));
        }
        self.lengthscale[i] = value;
        self.fixed[i] = true;
        Ok(())
    }

    /// Attach a Gamma prior to the variance and to each free lengthscale.
    pub fn set_priors(&mut self, prior: GammaPrior) {
        self.variance_prior = Some(prior);
        self.lengthscale_prior = Some(prior);
    }

    pub(crate) fn set_hyperparams(&mut self, variance: f64, lengthscale: &Array1<f64>) {
        self.variance = variance;
        self.lengthscale.assign(lengthscale);
    }

    /// Covariance matrix between the rows of `xa` and the rows of `xb`,
    /// shaped (nrows(xa), nrows(xb)).
    pub fn value(
        &self,
        xa: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        xb: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Array2<f64> {
        let sq = pairwise_sq_deviations(xa, xb);
        let inv_ell2 = self.lengthscale.mapv(|l| 1. / (l * l));
        let s = sq.dot(&inv_ell2);
        s.mapv(|v| self.variance * (-0.5 * v).exp())
            .into_shape((xa.nrows(), xb.nrows()))
            .unwrap()
    }

    /// Derivative of the training covariance matrix with respect to
    /// ln(variance), given the matrix `k` = value(x, x) itself.
    pub(crate) fn grad_ln_variance(&self, k: &Array2<f64>) -> Array2<f64> {
        k.to_owned()
    }

    /// Derivative of the training covariance matrix with respect to
    /// ln(lengthscale_d), given `x` and `k` = value(x, x).
    pub(crate) fn grad_ln_lengthscale(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        k: &Array2<f64>,
        d: usize,
    ) -> Array2<f64> {
        let n = x.nrows();
        let inv_ell2 = 1. / (self.lengthscale[d] * self.lengthscale[d]);
        let mut g = Array2::zeros((n, n));
        for i in 0..n {
            for j in 0..n {
                let diff = x[[i, d]] - x[[j, d]];
                g[[i, j]] = k[[i, j]] * diff * diff * inv_ell2;
            }
        }
        g
    }

    /// Summed log-prior density over the variance and free lengthscales.
    pub(crate) fn log_prior(&self) -> f64 {
        let mut lp = 0.;
        if let Some(pr) = &self.variance_prior {
            lp += pr.log_density(self.variance);
        }
        if let Some(pr) = &self.lengthscale_prior {
            for (i, &l) in self.lengthscale.iter().enumerate() {
                if !self.fixed[i] {
                    lp += pr.log_density(l);
                }
            }
        }
        lp
    }

    /// Gradient of the summed log-prior with respect to the natural log of
    /// each hyperparameter, ordered [variance, lengthscale_1..lengthscale_d].
    /// Fixed lengthscales get a zero entry.
    pub(crate) fn grad_ln_log_prior(&self) -> Array1<f64> {
        let mut g = Array1::zeros(self.dim() + 1);
        if let Some(pr) = &self.variance_prior {
            g[0] = pr.dlog_density_dln(self.variance);
        }
        if let Some(pr) = &self.lengthscale_prior {
            for (i, &l) in self.lengthscale.iter().enumerate() {
                if !self.fixed[i] {
                    g[i + 1] = pr.dlog_density_dln(l);
                }
            }
        }
        g
    }
}

impl fmt::Display for RbfKernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "RbfKernel(variance={}, lengthscale={})",
            self.variance, self.lengthscale
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_value_symmetric_unit_diag() {
        let mut kernel = RbfKernel::new(2).unwrap();
        kernel.set_hyperparams(2.5, &array![1., 0.5]);
        let x = array![[0., 1.], [1., 2.], [3., 0.]];
        let k = kernel.value(&x, &x);
        assert_eq!(k.dim(), (3, 3));
        for i in 0..3 {
            assert_abs_diff_eq!(k[[i, i]], 2.5, epsilon = 1e-12);
            for j in 0..3 {
                assert_abs_diff_eq!(k[[i, j]], k[[j, i]], epsilon = 1e-12);
            }
        }
        // k(x0, x1) = 2.5 exp(-1/2 (1/1 + 1/0.25))
        assert_abs_diff_eq!(k[[0, 1]], 2.5 * (-0.5 * 5.0f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_grad_ln_lengthscale_finite_diff() {
        let mut kernel = RbfKernel::new(2).unwrap();
        kernel.set_hyperparams(1.3, &array![0.8, 1.7]);
        let x = array![[0., 1.], [1., 2.], [3., 0.], [2., 2.]];
        let k = kernel.value(&x, &x);
        let h = 1e-6;
        for d in 0..2 {
            let g = kernel.grad_ln_lengthscale(&x, &k, d);
            let mut up = kernel.clone();
            let mut lo = kernel.clone();
            let mut ls_up = kernel.lengthscale().to_owned();
            let mut ls_lo = ls_up.to_owned();
            ls_up[d] = (ls_up[d].ln() + h).exp();
            ls_lo[d] = (ls_lo[d].ln() - h).exp();
            up.set_hyperparams(1.3, &ls_up);
            lo.set_hyperparams(1.3, &ls_lo);
            let num = (up.value(&x, &x) - lo.value(&x, &x)).mapv(|v| v / (2. * h));
            assert_abs_diff_eq!(g, num, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_fix_lengthscale_validation() {
        let mut kernel = RbfKernel::new(2).unwrap();
        assert!(kernel.fix_lengthscale(0, 0.).is_err());
        assert!(kernel.fix_lengthscale(0, -1.).is_err());
        assert!(kernel.fix_lengthscale(0, f64::NAN).is_err());
        assert!(kernel.fix_lengthscale(2, 1.).is_err());
        kernel.fix_lengthscale(1, 4.2).unwrap();
        assert!(kernel.is_fixed(1));
        assert_abs_diff_eq!(kernel.lengthscale()[1], 4.2);
    }

    #[test]
    fn test_log_prior_skips_fixed_dims() {
        let mut kernel = RbfKernel::new(2).unwrap();
        kernel.fix_lengthscale(0, 2.).unwrap();
        let pr = GammaPrior::default();
        kernel.set_priors(pr);
        let expected = pr.log_density(kernel.variance()) + pr.log_density(kernel.lengthscale()[1]);
        assert_abs_diff_eq!(kernel.log_prior(), expected, epsilon = 1e-12);
        let g = kernel.grad_ln_log_prior();
        assert_abs_diff_eq!(g[1], 0.);
        assert!(g[0] != 0. && g[2] != 0.);
    }

    #[test]
    fn test_zero_dim_rejected() {
        assert!(RbfKernel::new(0).is_err());
    }
}
