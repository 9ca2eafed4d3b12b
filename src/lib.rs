//! This library implements [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process)
//! regression models observed through a configurable link function.
//!
//! The latent function gets an anisotropic squared-exponential kernel with
//! one lengthscale per input dimension, each optionally fixed to a
//! user-supplied value. A Gamma prior regularizes the kernel variance and
//! the free lengthscales during hyperparameter optimization. Observations
//! relate to the latent function through an identity, log or probit [Link]:
//! with the identity link the posterior is obtained by exact Gaussian
//! conditioning, otherwise through the Laplace approximation at the
//! posterior mode. The strategy is chosen once at construction from the
//! configured link.
//!
//! The model is implemented by [LinkGp] parameterized by [LinkGpParams]
//! and fitted through the [linfa::traits::Fit] trait:
//!
//! ```no_run
//! use linkgp::{Link, LinkGp};
//! use linfa::prelude::*;
//! use ndarray::array;
//!
//! let x = array![[0., 1.], [1., 2.], [2., 3.], [3., 4.]];
//! let y = array![0.1, 0.9, 2.0, 3.1];
//! let model = LinkGp::params()
//!     .link(Link::from_name("identity"))
//!     .fit(&Dataset::new(x, y))
//!     .expect("LinkGp fitted");
//! let preds = model.predict(None).expect("predictions");
//! println!("mean/sd = {preds}");
//! ```
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
mod errors;
mod inference;
mod kernel;
mod likelihood;
mod priors;

mod optimization;
mod utils;

pub use algorithm::*;
pub use errors::*;
pub use inference::InferenceMethod;
pub use kernel::RbfKernel;
pub use likelihood::{GaussianLikelihood, Link};
pub use priors::GammaPrior;
