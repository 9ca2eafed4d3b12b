use crate::errors::{GpError, Result};
use libm::lgamma;

/// A Gamma(shape, rate) prior over a positive hyperparameter.
///
/// Attached to the kernel variance and to each free lengthscale, it
/// contributes an additive log-density term to the fitting objective.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GammaPrior {
    shape: f64,
    rate: f64,
}

impl GammaPrior {
    /// Build a Gamma prior from its shape and rate parameters.
    pub fn new(shape: f64, rate: f64) -> Result<GammaPrior> {
        if !(shape > 0. && shape.is_finite() && rate > 0. && rate.is_finite()) {
            return Err(GpError::InvalidValueError(format!(
                "Gamma prior requires positive finite shape and rate, got ({shape}, {rate})"
            )));
        }
        Ok(GammaPrior { shape, rate })
    }

    /// Build a Gamma prior matching a given mean and variance
    /// (shape = mean^2/variance, rate = mean/variance).
    pub fn from_mean_var(mean: f64, var: f64) -> Result<GammaPrior> {
        if !(mean > 0. && mean.is_finite() && var > 0. && var.is_finite()) {
            return Err(GpError::InvalidValueError(format!(
                "Gamma prior requires positive finite mean and variance, got ({mean}, {var})"
            )));
        }
        GammaPrior::new(mean * mean / var, mean / var)
    }

    /// Shape parameter
    pub fn shape(&self) -> f64 {
        self.shape
    }

    /// Rate parameter
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Log-density at `x` (x > 0)
    pub fn log_density(&self, x: f64) -> f64 {
        self.shape * self.rate.ln() - lgamma(self.shape) + (self.shape - 1.) * x.ln()
            - self.rate * x
    }

    /// Derivative of the log-density with respect to ln(x), at `x`
    pub(crate) fn dlog_density_dln(&self, x: f64) -> f64 {
        (self.shape - 1.) - self.rate * x
    }
}

impl Default for GammaPrior {
    /// Default prior with mean 1 and variance 3
    fn default() -> Self {
        GammaPrior::from_mean_var(1., 3.).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_from_mean_var_moments() {
        let pr = GammaPrior::from_mean_var(1., 3.).unwrap();
        assert_abs_diff_eq!(pr.shape(), 1. / 3., epsilon = 1e-12);
        assert_abs_diff_eq!(pr.rate(), 1. / 3., epsilon = 1e-12);
        // mean = shape/rate, var = shape/rate^2
        assert_abs_diff_eq!(pr.shape() / pr.rate(), 1., epsilon = 1e-12);
        assert_abs_diff_eq!(pr.shape() / (pr.rate() * pr.rate()), 3., epsilon = 1e-12);
    }

    #[test]
    fn test_log_density_exponential_case() {
        // Gamma(1, r) is Exponential(r): log p(x) = ln r - r x
        let pr = GammaPrior::new(1., 2.).unwrap();
        assert_abs_diff_eq!(pr.log_density(0.5), 2f64.ln() - 1., epsilon = 1e-12);
    }

    #[test]
    fn test_dlog_density_matches_finite_diff() {
        let pr = GammaPrior::default();
        let x: f64 = 0.7;
        let h = 1e-6;
        let num = (pr.log_density((x.ln() + h).exp()) - pr.log_density((x.ln() - h).exp()))
            / (2. * h);
        assert_abs_diff_eq!(pr.dlog_density_dln(x), num, epsilon = 1e-6);
    }

    #[test]
    fn test_rejects_bad_moments() {
        assert!(GammaPrior::from_mean_var(0., 3.).is_err());
        assert!(GammaPrior::from_mean_var(1., -1.).is_err());
        assert!(GammaPrior::new(f64::NAN, 1.).is_err());
    }
}
