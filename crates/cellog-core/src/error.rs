//! Error types for cellog-core

use thiserror::Error;

/// Result type alias for cellog operations
pub type Result<T> = std::result::Result<T, CellogError>;

/// Main error type for cellog operations
#[derive(Error, Debug)]
pub enum CellogError {
    /// A referenced material, job, or counter does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A precondition of a mutation was violated
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A caller-supplied argument is invalid
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Underlying SQLite or I/O failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON encode/decode failure on a detail payload
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for CellogError {
    fn from(err: rusqlite::Error) -> Self {
        CellogError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CellogError {
    fn from(err: serde_json::Error) -> Self {
        CellogError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for CellogError {
    fn from(err: std::io::Error) -> Self {
        CellogError::Storage(err.to_string())
    }
}
