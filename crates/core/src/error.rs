//! Engine error model.

use thiserror::Error;

/// Result type used across the engine.
pub type SyncResult<T> = Result<T, SyncError>;

/// Engine-level error.
///
/// `NotFound`, `NotAllowed` and `InvalidRequest` surface synchronously to the
/// caller. `TransientSource` is retried by the supervisor; `Logical` and
/// `Internal` terminate a job immediately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A referenced table or job does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The table exists but is inactive or unregistered for this operation.
    #[error("not allowed: {0}")]
    NotAllowed(String),

    /// The request itself is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Retryable connectivity/timeout fault reported by the source warehouse.
    #[error("transient source error: {0}")]
    TransientSource(String),

    /// Malformed query, permission denial or schema mismatch. Never retried.
    #[error("logical error: {0}")]
    Logical(String),

    /// Unexpected fault while writing the destination or updating metadata.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn not_allowed(msg: impl Into<String>) -> Self {
        Self::NotAllowed(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientSource(msg.into())
    }

    pub fn logical(msg: impl Into<String>) -> Self {
        Self::Logical(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the supervisor may retry the job body after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientSource(_))
    }
}
