//! Cyndi error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Data read during a validation pass was malformed or incomplete.
    ///
    /// This is never fatal. The validation pass which observed it is classified as a failure.
    #[error("malformed validation data: {0}")]
    ValidationData(String),
    /// A pipeline status invariant does not hold.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl AppError {
    /// Check if the given error chain carries a validation data error.
    pub fn is_validation_data(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|cause| matches!(cause.downcast_ref::<AppError>(), Some(AppError::ValidationData(_))))
    }
}
