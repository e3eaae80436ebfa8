//! Common error types for Buddy sync.

use thiserror::Error;

/// Top-level error type for sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Remote unreachable or timed out. Retried with backoff.
    #[error("Network error: {0}")]
    Network(String),

    /// Version mismatch between local and remote copies of a record.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed payload. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Battery, storage or capacity pressure.
    #[error("Resource constraint: {0}")]
    ResourceConstraint(String),

    /// Storage backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Whether the failure may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("timeout".into()).is_transient());
        assert!(!Error::Validation("bad payload".into()).is_transient());
        assert!(!Error::Conflict("v2 > v1".into()).is_transient());
        assert!(!Error::ResourceConstraint("queue full".into()).is_transient());
    }
}
