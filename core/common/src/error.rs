//! Common error types for Ledgersync.

use thiserror::Error;

/// Top-level error type for Ledgersync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local cache operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

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

    /// Transport-level failure talking to the remote store.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote store rejected our credentials.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Remote store refused the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Remote store reported a failure that is not transport related.
    #[error("Remote error: {0}")]
    Remote(String),

    /// A live subscription could not deliver a snapshot.
    #[error("Subscription error: {0}")]
    Subscription(String),
}

impl Error {
    /// Whether the failure is worth retrying right away.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
