use thiserror::Error;

/// A result type for GP regression with link functions
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when fitting or using a [`LinkGp`](crate::LinkGp) model
#[derive(Error, Debug)]
pub enum GpError {
    /// When the (approximate) marginal likelihood computation fails
    #[error("Likelihood computation error: {0}")]
    LikelihoodComputationError(String),
    #[error(transparent)]
    /// When linear algebra computation fails
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
    /// When input data shapes are inconsistent
    #[error("Shape error: {0}")]
    ShapeError(String),
    /// When an error is due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}
