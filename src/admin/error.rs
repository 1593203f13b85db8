use thiserror::Error;

use crate::types::QuotaError;

/// Error type for administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Custom error message.
    #[error("{0}")]
    Message(String),
    /// Core quota error.
    #[error(transparent)]
    Core(#[from] QuotaError),
    /// Report could not be rendered.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;
