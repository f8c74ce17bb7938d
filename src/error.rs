//! Named (not typed) error taxonomy shared by storage and the use-case
//! layer, and the HTTP/RPC status mapping at the edges.

use std::time::Duration;

use thiserror::Error;

/// Kinds used across storage and use-case errors. Named rather than typed
/// so both transports can map the same taxonomy to their own status codes.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("not found")]
    NotFound,
    #[error("unsupported metric type")]
    UnsupportedMetricType,
    #[error("internal: {0}")]
    Internal(String),
    #[error("transient, retry after {0:?}")]
    Transient(Duration),
}

impl AppError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        AppError::Internal(err.to_string())
    }
}
