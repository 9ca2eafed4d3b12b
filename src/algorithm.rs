use crate::errors::{GpError, Result};
use crate::inference::{
    exact_log_marginal, laplace_log_marginal, posterior_mean_cov, posterior_mean_var, InferenceMethod,
    InnerState, LAPLACE_MAX_ITER,
};
use crate::kernel::RbfKernel;
use crate::likelihood::{GaussianLikelihood, Link};
use crate::optimization::{optimize_params, SlsqpParams};
use crate::priors::GammaPrior;
use crate::utils::{cholesky_with_jitter, has_duplicate_rows};

use finitediff::FiniteDiff;
use linfa::prelude::{DatasetBase, Fit, PredictInplace};
use linfa::ParamGuard;
use log::{debug, warn};
use ndarray::{s, Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand_xoshiro::rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;
use std::fmt;

/// log10 search bounds applied to every optimized hyperparameter
pub const PARAM_BOUNDS_LOG10: (f64, f64) = (-6., 6.);
/// Default maximum number of objective evaluations during optimization
pub const GP_DEFAULT_MAX_EVAL: usize = 500;

/// A set of validated parameters for fitting a [`LinkGp`] model.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkGpValidParams {
    /// Observation link function
    link: Link,
    /// Number of posterior draws returned by predict (None = closed form)
    samples: Option<usize>,
    /// Per-dimension fixed lengthscales (None entry = optimized)
    lengthscale: Option<Vec<Option<f64>>>,
    /// Prior attached to the kernel variance and each free lengthscale
    prior: Option<GammaPrior>,
    /// Initial observation noise variance
    noise_init: f64,
    /// Diagonal loading factor improving numerical stability
    nugget: f64,
    /// Max number of objective evaluations during optimization
    max_eval: usize,
    /// Newton iteration cap for the Laplace mode search
    laplace_max_iter: usize,
}

impl Default for LinkGpValidParams {
    fn default() -> LinkGpValidParams {
        LinkGpValidParams {
            link: Link::default(),
            samples: None,
            lengthscale: None,
            prior: Some(GammaPrior::default()),
            noise_init: 1.,
            nugget: 100. * f64::EPSILON,
            max_eval: GP_DEFAULT_MAX_EVAL,
            laplace_max_iter: LAPLACE_MAX_ITER,
        }
    }
}

impl LinkGpValidParams {
    /// Observation link
    pub fn link(&self) -> Link {
        self.link
    }

    /// Number of posterior draws per prediction point, None for closed form
    pub fn samples(&self) -> Option<usize> {
        self.samples
    }

    /// Fixed lengthscale specification
    pub fn lengthscale(&self) -> Option<&Vec<Option<f64>>> {
        self.lengthscale.as_ref()
    }

    /// Hyperparameter prior
    pub fn prior(&self) -> Option<GammaPrior> {
        self.prior
    }

    /// Initial noise variance
    pub fn noise_init(&self) -> f64 {
        self.noise_init
    }

    /// Diagonal loading factor
    pub fn nugget(&self) -> f64 {
        self.nugget
    }

    /// Max number of objective evaluations
    pub fn max_eval(&self) -> usize {
        self.max_eval
    }

    /// Newton iteration cap for the Laplace mode search
    pub fn laplace_max_iter(&self) -> usize {
        self.laplace_max_iter
    }
}

/// The set of parameters configuring a [`LinkGp`] fit, checked through
/// [`linfa::ParamGuard`] before use.
#[derive(Clone, Debug)]
pub struct LinkGpParams(LinkGpValidParams);

impl Default for LinkGpParams {
    fn default() -> Self {
        LinkGpParams::new()
    }
}

impl LinkGpParams {
    /// Constructor with default values: identity link, closed-form
    /// predictions, all lengthscales optimized, Gamma(mean=1, variance=3)
    /// prior on the kernel variance and lengthscales.
    pub fn new() -> LinkGpParams {
        LinkGpParams(LinkGpValidParams::default())
    }

    /// Set the observation link function.
    pub fn link(mut self, link: Link) -> Self {
        self.0.link = link;
        self
    }

    /// Request `n` Monte-Carlo posterior draws per prediction point instead
    /// of the closed-form mean/standard-deviation.
    pub fn samples(mut self, n: usize) -> Self {
        self.0.samples = Some(n);
        self
    }

    /// Fix lengthscales per dimension: `Some(v)` locks dimension to `v`,
    /// `None` leaves it optimized. The vector length must match the
    /// covariate column count at fit time.
    pub fn lengthscale(mut self, lengthscale: Vec<Option<f64>>) -> Self {
        self.0.lengthscale = Some(lengthscale);
        self
    }

    /// Set (or disable with None) the Gamma prior on the kernel variance
    /// and free lengthscales.
    pub fn prior(mut self, prior: Option<GammaPrior>) -> Self {
        self.0.prior = prior;
        self
    }

    /// Set the initial observation noise variance.
    pub fn noise_init(mut self, noise_init: f64) -> Self {
        self.0.noise_init = noise_init;
        self
    }

    /// Set nugget.
    ///
    /// Nugget is used to improve numerical stability
    pub fn nugget(mut self, nugget: f64) -> Self {
        self.0.nugget = nugget;
        self
    }

    /// Set the max number of objective evaluations during optimization.
    pub fn max_eval(mut self, max_eval: usize) -> Self {
        self.0.max_eval = max_eval;
        self
    }

    /// Set the Newton iteration cap for the Laplace mode search.
    ///
    /// Exceeding the cap does not abort the fit; it is reported through
    /// [`LinkGp::mode_converged`].
    pub fn laplace_max_iter(mut self, laplace_max_iter: usize) -> Self {
        self.0.laplace_max_iter = laplace_max_iter;
        self
    }
}

impl ParamGuard for LinkGpParams {
    type Checked = LinkGpValidParams;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        if !(self.0.noise_init > 0. && self.0.noise_init.is_finite()) {
            return Err(GpError::InvalidValueError(format!(
                "initial noise variance must be positive and finite, got {}",
                self.0.noise_init
            )));
        }
        if !(self.0.nugget >= 0.) {
            return Err(GpError::InvalidValueError(
                "nugget cannot be negative".to_string(),
            ));
        }
        if self.0.laplace_max_iter == 0 {
            return Err(GpError::InvalidValueError(
                "Laplace iteration cap cannot be 0".to_string(),
            ));
        }
        if let Some(ls) = &self.0.lengthscale {
            for v in ls.iter().flatten() {
                if !(*v > 0. && v.is_finite()) {
                    return Err(GpError::InvalidValueError(format!(
                        "fixed lengthscale must be a positive finite value, got {v}"
                    )));
                }
            }
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

/// Mapping between the full hyperparameter vector
/// [variance, lengthscale_1..lengthscale_d, noise_variance] and the subset
/// of free entries handed to the optimizer.
struct ParamLayout {
    dim: usize,
    free: Vec<usize>,
}

impl ParamLayout {
    fn new(kernel: &RbfKernel) -> ParamLayout {
        let dim = kernel.dim();
        let mut free = vec![0];
        for i in 0..dim {
            if !kernel.is_fixed(i) {
                free.push(i + 1);
            }
        }
        free.push(dim + 1);
        ParamLayout { dim, free }
    }

    /// Full vector with free slots overwritten by 10^p
    fn full_from(&self, base: &Array1<f64>, p: &[f64]) -> Array1<f64> {
        let mut full = base.to_owned();
        for (j, &idx) in self.free.iter().enumerate() {
            full[idx] = 10f64.powf(p[j]);
        }
        full
    }

    /// log10 of the free entries of a full vector
    fn free_log10(&self, full: &Array1<f64>) -> Array1<f64> {
        self.free.iter().map(|&i| full[i].log10()).collect()
    }
}

/// Negated fitting objective: -(log marginal likelihood + log priors), as a
/// function of the log10-scale free hyperparameters.
struct Objective<'a> {
    kernel: &'a RbfKernel,
    lik: &'a GaussianLikelihood,
    method: InferenceMethod,
    x: &'a Array2<f64>,
    y: &'a Array1<f64>,
    ycol: &'a Array2<f64>,
    layout: &'a ParamLayout,
    base: &'a Array1<f64>,
    nugget: f64,
    laplace_max_iter: usize,
}

impl Objective<'_> {
    fn instantiate(&self, p: &[f64]) -> Option<(RbfKernel, f64)> {
        // the optimizer may evaluate nan iterates
        if p.iter().any(|v| v.is_nan()) {
            return None;
        }
        let full = self.layout.full_from(self.base, p);
        let mut kernel = self.kernel.clone();
        kernel.set_hyperparams(full[0], &full.slice(s![1..=self.layout.dim]).to_owned());
        Some((kernel, full[self.layout.dim + 1]))
    }

    fn value(&self, p: &[f64]) -> f64 {
        let (kernel, noise) = match self.instantiate(p) {
            Some(v) => v,
            None => return f64::INFINITY,
        };
        let lml = match self.method {
            InferenceMethod::ExactGaussian => {
                exact_log_marginal(&kernel, noise, self.x, self.ycol, self.nugget, false)
                    .map(|r| r.0)
            }
            InferenceMethod::Laplace => laplace_log_marginal(
                &kernel,
                &self.lik.with_variance(noise),
                self.x,
                self.y,
                self.nugget,
                self.laplace_max_iter,
            )
            .map(|r| r.0),
        };
        match lml {
            Ok(v) => -(v + kernel.log_prior()),
            Err(_) => f64::INFINITY,
        }
    }

    fn value_grad(&self, p: &[f64], grad: &mut [f64]) -> f64 {
        match self.method {
            InferenceMethod::ExactGaussian => {
                let (kernel, noise) = match self.instantiate(p) {
                    Some(v) => v,
                    None => {
                        grad.iter_mut().for_each(|g| *g = 0.);
                        return f64::INFINITY;
                    }
                };
                match exact_log_marginal(&kernel, noise, self.x, self.ycol, self.nugget, true) {
                    Ok((lml, Some(mut g_ln), _)) => {
                        let g_prior = kernel.grad_ln_log_prior();
                        for idx in 0..=self.layout.dim {
                            g_ln[idx] += g_prior[idx];
                        }
                        for (j, &idx) in self.layout.free.iter().enumerate() {
                            grad[j] = -g_ln[idx] * std::f64::consts::LN_10;
                        }
                        -(lml + kernel.log_prior())
                    }
                    _ => {
                        grad.iter_mut().for_each(|g| *g = 0.);
                        f64::INFINITY
                    }
                }
            }
            InferenceMethod::Laplace => {
                // no tractable closed form for the Laplace gradient wrt the
                // hyperparameters: central finite differences
                let f = |v: &Vec<f64>| self.value(v);
                let g = p.to_vec().central_diff(&f);
                grad.copy_from_slice(&g);
                self.value(p)
            }
        }
    }
}

/// A GP regression model relating a response to covariates through a latent
/// Gaussian process observed through a configurable [`Link`] function.
///
/// The model is fit once at construction: the kernel is built with one
/// lengthscale per covariate column, requested lengthscales are fixed,
/// priors attached, the inference strategy is selected from the
/// likelihood/link pair, and the free hyperparameters are optimized by
/// maximizing the (approximate) log marginal likelihood plus log priors.
/// The fitted state is retained and reused by every prediction.
///
/// # Example
///
/// ```no_run
/// use linkgp::{Link, LinkGp};
/// use linfa::prelude::*;
/// use ndarray::array;
///
/// let x = array![[0., 1.], [1., 2.], [2., 3.], [3., 4.]];
/// let y = array![0.1, 0.9, 2.0, 3.1];
/// let model = LinkGp::params()
///     .link(Link::Identity)
///     .fit(&Dataset::new(x, y))
///     .expect("LinkGp fitted");
/// let preds = model.predict(None).expect("predictions"); // (4, 2) [mean, sd]
/// println!("hyperparameters: {}", model.param_array());
/// ```
#[derive(Clone, Debug)]
pub struct LinkGp {
    /// ARD-RBF kernel with its fitted hyperparameters
    kernel: RbfKernel,
    /// Gaussian observation likelihood with its fitted noise variance
    lik: GaussianLikelihood,
    /// Inference strategy selected at construction
    method: InferenceMethod,
    /// Fitted inference state reused by predictions
    inner: InnerState,
    /// Optimized objective: log marginal likelihood plus log priors
    likelihood: f64,
    /// Whether the hyperparameter optimization met its tolerance
    converged: bool,
    /// Training dataset (input, output)
    training_data: (Array2<f64>, Array1<f64>),
    /// Parameters used to fit this model
    params: LinkGpValidParams,
}

impl LinkGp {
    /// LinkGp parameters constructor
    pub fn params() -> LinkGpParams {
        LinkGpParams::new()
    }

    /// Full hyperparameter vector (fixed and free) in stable order:
    /// kernel variance, lengthscale per dimension, noise variance.
    pub fn param_array(&self) -> Array1<f64> {
        let dim = self.kernel.dim();
        let mut p = Array1::zeros(dim + 2);
        p[0] = self.kernel.variance();
        for i in 0..dim {
            p[i + 1] = self.kernel.lengthscale()[i];
        }
        p[dim + 1] = self.lik.variance();
        p
    }

    /// Predictions at `xnew`, or at the training inputs when `xnew` is None.
    ///
    /// Returns a (n, 2) [mean, standard deviation] matrix when the model was
    /// configured without samples, otherwise a (n, k) matrix of posterior
    /// draws. Mean and standard deviation are noiseless: they carry the
    /// latent-function uncertainty only.
    pub fn predict(&self, xnew: Option<&Array2<f64>>) -> Result<Array2<f64>> {
        match xnew {
            Some(x) => self.predict_at(x),
            None => self.predict_at(&self.training_data.0.view()),
        }
    }

    /// Predictions for a 1-D covariate vector, treated as its single-column
    /// matrix form.
    pub fn predict_series(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix1>) -> Result<Array2<f64>> {
        let xcol = x.to_owned().insert_axis(Axis(1));
        self.predict(Some(&xcol))
    }

    fn predict_at(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Result<Array2<f64>> {
        match self.params.samples() {
            None => self.predict_mean_sd(x),
            Some(k) => self.sample(x, k),
        }
    }

    /// Closed-form posterior predictions as a (n, 2) [mean, sd] matrix.
    pub fn predict_mean_sd(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Result<Array2<f64>> {
        self.check_cols(x)?;
        let (mean, var) =
            posterior_mean_var(&self.kernel, &self.training_data.0, &self.inner, x)?;
        let mut out = Array2::zeros((x.nrows(), 2));
        out.column_mut(0).assign(&mean);
        out.column_mut(1).assign(&var.mapv(f64::sqrt));
        Ok(out)
    }

    /// Draw `n_samples` independent samples per row of `x` from the posterior
    /// latent-function distribution, as a (n, n_samples) matrix.
    pub fn sample(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        n_samples: usize,
    ) -> Result<Array2<f64>> {
        let mut rng = Xoshiro256Plus::from_entropy();
        self.sample_with_rng(x, n_samples, &mut rng)
    }

    /// Same as [`LinkGp::sample`] with a caller-supplied random generator.
    pub fn sample_with_rng(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        n_samples: usize,
        rng: &mut impl Rng,
    ) -> Result<Array2<f64>> {
        self.check_cols(x)?;
        let (mean, cov) = posterior_mean_cov(&self.kernel, &self.training_data.0, &self.inner, x)?;
        let c = cholesky_with_jitter(&cov, self.params.nugget().max(1e-10))?;
        let normal = Normal::new(0., 1.).unwrap();
        let draws = Array2::random_using((x.nrows(), n_samples), normal, rng);
        Ok(c.dot(&draws) + mean.insert_axis(Axis(1)))
    }

    fn check_cols(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Result<()> {
        let expected = self.training_data.0.ncols();
        if x.ncols() != expected {
            return Err(GpError::ShapeError(format!(
                "prediction input has {} columns, training set has {expected}",
                x.ncols()
            )));
        }
        Ok(())
    }

    /// Inference strategy selected at construction
    pub fn inference(&self) -> InferenceMethod {
        self.method
    }

    /// Whether the hyperparameter optimization converged; when false the
    /// model still carries the best iterate found.
    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Whether the Laplace Newton mode search converged
    /// (always true for exact inference).
    pub fn mode_converged(&self) -> bool {
        match &self.inner {
            InnerState::Exact(_) => true,
            InnerState::Laplace(state) => state.converged,
        }
    }

    /// Retrieve the optimized objective value: log marginal likelihood plus
    /// log priors at the fitted hyperparameters.
    pub fn likelihood(&self) -> f64 {
        self.likelihood
    }

    /// Estimated process variance
    pub fn variance(&self) -> f64 {
        self.kernel.variance()
    }

    /// Estimated (or fixed) per-dimension lengthscales
    pub fn lengthscale(&self) -> &Array1<f64> {
        self.kernel.lengthscale()
    }

    /// Estimated observation noise variance
    pub fn noise_variance(&self) -> f64 {
        self.lik.variance()
    }

    /// Observation link
    pub fn link(&self) -> Link {
        self.lik.link()
    }

    /// Retrieve input and output dimensions
    pub fn dims(&self) -> (usize, usize) {
        (self.training_data.0.ncols(), 1)
    }
}

impl fmt::Display for LinkGp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "LinkGp(inference={}, link={}, kernel={}, noise={}, likelihood={})",
            self.method,
            self.lik.link(),
            self.kernel,
            self.lik.variance(),
            self.likelihood,
        )
    }
}

impl<D: Data<Elem = f64>> PredictInplace<ArrayBase<D, Ix2>, Array2<f64>> for LinkGp {
    fn predict_inplace(&self, x: &ArrayBase<D, Ix2>, y: &mut Array2<f64>) {
        assert_eq!(
            x.nrows(),
            y.nrows(),
            "The number of data points must match the number of output targets."
        );
        *y = self.predict_at(x).expect("LinkGp prediction");
    }

    fn default_target(&self, x: &ArrayBase<D, Ix2>) -> Array2<f64> {
        Array2::zeros((x.nrows(), self.params.samples().unwrap_or(2)))
    }
}

impl<D: Data<Elem = f64>> Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>, GpError>
    for LinkGpValidParams
{
    type Object = LinkGp;

    /// Fit the GP hyperparameters by maximum penalized marginal likelihood,
    /// then retain the posterior state for predictions.
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>>,
    ) -> Result<Self::Object> {
        let x = dataset.records().to_owned();
        let y = dataset.targets().to_owned();
        if x.nrows() != y.len() {
            return Err(GpError::ShapeError(format!(
                "training input has {} rows, output has {}",
                x.nrows(),
                y.len()
            )));
        }
        if x.nrows() < 2 {
            return Err(GpError::InvalidValueError(
                "at least two training points are required".to_string(),
            ));
        }
        if has_duplicate_rows(&x) {
            warn!("multiple identical training inputs (at least same row twice)");
        }

        let mut kernel = RbfKernel::new(x.ncols())?;
        if let Some(ls) = self.lengthscale() {
            if ls.len() != x.ncols() {
                return Err(GpError::ShapeError(format!(
                    "lengthscale specification has {} entries, training input has {} columns",
                    ls.len(),
                    x.ncols()
                )));
            }
            for (i, v) in ls.iter().enumerate() {
                if let Some(v) = v {
                    kernel.fix_lengthscale(i, *v)?;
                }
            }
        }
        if let Some(prior) = self.prior() {
            kernel.set_priors(prior);
        }
        let mut lik = GaussianLikelihood::new(self.link()).with_variance(self.noise_init());
        let method = if lik.is_conjugate() {
            InferenceMethod::ExactGaussian
        } else {
            InferenceMethod::Laplace
        };

        let ycol = y.to_owned().insert_axis(Axis(1));
        let layout = ParamLayout::new(&kernel);
        let mut base = Array1::zeros(layout.dim + 2);
        base[0] = kernel.variance();
        for i in 0..layout.dim {
            base[i + 1] = kernel.lengthscale()[i];
        }
        base[layout.dim + 1] = lik.variance();

        let objective = Objective {
            kernel: &kernel,
            lik: &lik,
            method,
            x: &x,
            y: &y,
            ycol: &ycol,
            layout: &layout,
            base: &base,
            nugget: self.nugget(),
            laplace_max_iter: self.laplace_max_iter(),
        };
        let (lo, up) = PARAM_BOUNDS_LOG10;
        let p0 = layout.free_log10(&base).mapv(|v| v.clamp(lo, up));
        let bounds = vec![PARAM_BOUNDS_LOG10; layout.free.len()];
        debug!("Optimize {method} objective from log10 params {p0} within {bounds:?}");
        let objfn = |p: &[f64], grad: Option<&mut [f64]>, _: &mut ()| match grad {
            Some(grad) => objective.value_grad(p, grad),
            None => objective.value(p),
        };
        let (fval, p_opt, converged) = optimize_params(
            objfn,
            &p0,
            &bounds,
            SlsqpParams {
                maxeval: self.max_eval(),
                ..Default::default()
            },
        );
        if !converged {
            warn!("hyperparameter optimization did not converge, keeping last iterate");
        }
        debug!("Optimum {fval} at log10 params {p_opt}");

        let full = layout.full_from(&base, p_opt.as_slice().unwrap());
        kernel.set_hyperparams(full[0], &full.slice(s![1..=layout.dim]).to_owned());
        lik = lik.with_variance(full[layout.dim + 1]);

        let (lml, inner) = match method {
            InferenceMethod::ExactGaussian => {
                let (lml, _, state) =
                    exact_log_marginal(&kernel, lik.variance(), &x, &ycol, self.nugget(), false)?;
                (lml, InnerState::Exact(state))
            }
            InferenceMethod::Laplace => {
                let (lml, state) = laplace_log_marginal(
                    &kernel,
                    &lik,
                    &x,
                    &y,
                    self.nugget(),
                    self.laplace_max_iter(),
                )?;
                if !state.converged {
                    warn!(
                        "Laplace mode search hit its iteration cap after {} iterations",
                        state.n_iter
                    );
                }
                (lml, InnerState::Laplace(state))
            }
        };
        let likelihood = lml + kernel.log_prior();

        Ok(LinkGp {
            kernel,
            lik,
            method,
            inner,
            likelihood,
            converged,
            training_data: (x, y),
            params: self.clone(),
        })
    }
}
