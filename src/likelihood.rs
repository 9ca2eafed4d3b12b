//! Observation likelihood: Gaussian noise composed with a link function.
//!
//! The link maps the latent GP value `f` to the observation-space location
//! of the Gaussian noise model. With the identity link the model is conjugate
//! and exact inference applies; the log and probit links require the Laplace
//! approximation.

use libm::erfc;
use ndarray::Array1;
use std::fmt;

const SQRT_2PI: f64 = 2.5066282746310007;

/// Cumulative distribution function of Standard Normal at x
pub(crate) fn norm_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Probability density function of Standard Normal at x
pub(crate) fn norm_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / SQRT_2PI
}

/// A link function mapping the latent value to the observation-space
/// parameter of the Gaussian noise model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Link {
    /// g(f) = f
    #[default]
    Identity,
    /// g(f) = exp(f)
    Log,
    /// g(f) = Phi(f), the standard normal CDF
    Probit,
}

impl Link {
    /// Select a link from its name: "probit" and "log" map to the
    /// corresponding variants, any other name falls back to [`Link::Identity`].
    ///
    /// The silent fallback mirrors the historical behavior of this model and
    /// is intentional; it is not an error.
    pub fn from_name(name: &str) -> Link {
        match name {
            "probit" => Link::Probit,
            "log" => Link::Log,
            _ => Link::Identity,
        }
    }

    /// g(f)
    pub fn value(&self, f: f64) -> f64 {
        match self {
            Link::Identity => f,
            Link::Log => f.exp(),
            Link::Probit => norm_cdf(f),
        }
    }

    /// dg/df
    pub(crate) fn deriv(&self, f: f64) -> f64 {
        match self {
            Link::Identity => 1.,
            Link::Log => f.exp(),
            Link::Probit => norm_pdf(f),
        }
    }

    /// d2g/df2
    pub(crate) fn second_deriv(&self, f: f64) -> f64 {
        match self {
            Link::Identity => 0.,
            Link::Log => f.exp(),
            Link::Probit => -f * norm_pdf(f),
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Link::Identity => write!(f, "Identity"),
            Link::Log => write!(f, "Log"),
            Link::Probit => write!(f, "Probit"),
        }
    }
}

/// Gaussian observation noise composed with a [`Link`]:
/// p(y|f) = N(y | g(f), variance).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GaussianLikelihood {
    /// Observation noise variance
    pub(crate) variance: f64,
    /// Link function applied to the latent value
    pub(crate) link: Link,
}

impl GaussianLikelihood {
    /// Gaussian likelihood with the given link and unit noise variance.
    pub fn new(link: Link) -> GaussianLikelihood {
        GaussianLikelihood { link, variance: 1. }
    }

    /// Set the noise variance.
    pub fn with_variance(mut self, variance: f64) -> GaussianLikelihood {
        self.variance = variance;
        self
    }

    /// Noise variance
    pub fn variance(&self) -> f64 {
        self.variance
    }

    /// Link function
    pub fn link(&self) -> Link {
        self.link
    }

    /// Whether the likelihood/link pair admits closed-form Gaussian inference.
    pub fn is_conjugate(&self) -> bool {
        matches!(self.link, Link::Identity)
    }

    /// log p(y|f) at a single observation
    pub fn log_density(&self, y: f64, f: f64) -> f64 {
        let r = y - self.link.value(f);
        -0.5 * (2. * std::f64::consts::PI * self.variance).ln() - r * r / (2. * self.variance)
    }

    /// d log p(y|f) / df
    pub(crate) fn grad_f(&self, y: f64, f: f64) -> f64 {
        (y - self.link.value(f)) * self.link.deriv(f) / self.variance
    }

    /// d2 log p(y|f) / df2
    pub(crate) fn hessian_f(&self, y: f64, f: f64) -> f64 {
        let g = self.link.value(f);
        let dg = self.link.deriv(f);
        let d2g = self.link.second_deriv(f);
        (-dg * dg + (y - g) * d2g) / self.variance
    }

    /// Sum of log-densities with the per-point gradient and Hessian diagonal,
    /// as needed by the Laplace mode search.
    pub(crate) fn eval(&self, y: &Array1<f64>, f: &Array1<f64>) -> (f64, Array1<f64>, Array1<f64>) {
        let mut ll = 0.;
        let mut grad = Array1::zeros(y.len());
        let mut hess = Array1::zeros(y.len());
        for i in 0..y.len() {
            ll += self.log_density(y[i], f[i]);
            grad[i] = self.grad_f(y[i], f[i]);
            hess[i] = self.hessian_f(y[i], f[i]);
        }
        (ll, grad, hess)
    }
}

impl fmt::Display for GaussianLikelihood {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Gaussian(link={}, variance={})", self.link, self.variance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_link_from_name_defaults_to_identity() {
        assert_eq!(Link::from_name("probit"), Link::Probit);
        assert_eq!(Link::from_name("log"), Link::Log);
        assert_eq!(Link::from_name("identity"), Link::Identity);
        assert_eq!(Link::from_name("anything-else"), Link::Identity);
        assert_eq!(Link::from_name(""), Link::Identity);
    }

    #[test]
    fn test_norm_cdf_pdf() {
        assert_abs_diff_eq!(norm_cdf(0.), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(norm_cdf(1.96), 0.975, epsilon = 1e-3);
        assert_abs_diff_eq!(norm_pdf(0.), 0.3989422804014327, epsilon = 1e-12);
    }

    #[test]
    fn test_link_derivatives_finite_diff() {
        let h = 1e-6;
        for link in [Link::Identity, Link::Log, Link::Probit] {
            for f in [-1.2, 0., 0.7] {
                let num_d = (link.value(f + h) - link.value(f - h)) / (2. * h);
                assert_abs_diff_eq!(link.deriv(f), num_d, epsilon = 1e-5);
                let num_d2 = (link.deriv(f + h) - link.deriv(f - h)) / (2. * h);
                assert_abs_diff_eq!(link.second_deriv(f), num_d2, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_likelihood_derivatives_finite_diff() {
        let h = 1e-6;
        let lik = GaussianLikelihood::new(Link::Probit).with_variance(0.3);
        let (y, f) = (0.8, 0.4);
        let num_g = (lik.log_density(y, f + h) - lik.log_density(y, f - h)) / (2. * h);
        assert_abs_diff_eq!(lik.grad_f(y, f), num_g, epsilon = 1e-5);
        let num_h = (lik.grad_f(y, f + h) - lik.grad_f(y, f - h)) / (2. * h);
        assert_abs_diff_eq!(lik.hessian_f(y, f), num_h, epsilon = 1e-5);
    }

    #[test]
    fn test_conjugacy() {
        assert!(GaussianLikelihood::new(Link::Identity).is_conjugate());
        assert!(!GaussianLikelihood::new(Link::Log).is_conjugate());
        assert!(!GaussianLikelihood::new(Link::Probit).is_conjugate());
    }
}
