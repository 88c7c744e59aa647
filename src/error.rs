//! Error types for zlimit.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for zlimit operations.
#[derive(Error, Debug)]
pub enum ZlimitError {
    /// The admission request was malformed (empty key, zero limit or zero window).
    #[error("Invalid admission request: {0}")]
    InvalidRequest(String),

    /// The shared store could not be reached, or the operation timed out
    /// before it completed.
    #[error("Shared store unavailable for key {key}: {source}")]
    StoreUnavailable {
        key: String,
        #[source]
        source: StoreError,
    },

    /// The shared store was reached but an operation against it failed.
    #[error("Failed to {operation} for key {key}: {source}")]
    StoreOperationFailed {
        key: String,
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    /// A header needed to build the caller key was absent or blank.
    #[error("the header {0} must have a value set")]
    MissingKeyHeader(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ZlimitError {
    /// Attach the caller key to a store error, keeping unreachable stores
    /// distinct from failed commands.
    pub fn from_store(key: &str, operation: &'static str, source: StoreError) -> Self {
        if source.is_unavailable() {
            ZlimitError::StoreUnavailable {
                key: key.to_string(),
                source,
            }
        } else {
            ZlimitError::StoreOperationFailed {
                key: key.to_string(),
                operation,
                source,
            }
        }
    }

    /// Whether this error came from the shared store rather than the request.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            ZlimitError::StoreUnavailable { .. } | ZlimitError::StoreOperationFailed { .. }
        )
    }
}

impl From<config::ConfigError> for ZlimitError {
    fn from(err: config::ConfigError) -> Self {
        ZlimitError::Config(err.to_string())
    }
}

/// Result type alias for zlimit operations.
pub type Result<T> = std::result::Result<T, ZlimitError>;
