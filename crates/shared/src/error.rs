use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body used by REST responses and `error` push frames.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// `{ "error": { "code": ..., "message": ... } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ApiError,
}
