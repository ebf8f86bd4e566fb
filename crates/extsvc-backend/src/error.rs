//! Error types for coordination backend calls.

use thiserror::Error;

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors that can occur while talking to the coordination backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The backend could not be reached (connection refused, timeout, ...).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with a non-success status.
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// The backend understood the request but refused it
    /// (e.g. a session bound to a critical check).
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("serialization error: {0}")]
    Encode(String),

    #[error("deserialization error: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl BackendError {
    /// Whether this error means the backend itself is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }

    /// Whether this error means the addressed object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
            || matches!(self, BackendError::Status { status: 404, .. })
    }
}
