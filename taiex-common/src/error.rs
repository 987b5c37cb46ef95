//! Error types shared by the taiex services.

use thiserror::Error;

/// Result type alias using the taiex error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that are allowed to escape a sync or screening run.
///
/// Per-row and per-batch failures never surface as this type; they are
/// contained and counted by the engine. Only conditions the caller must act
/// on end up here.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (missing connection parameters, bad values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Every source consulted for an operation failed
    #[error("All sources exhausted: {0}")]
    SourcesExhausted(String),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Process exit code used by the CLI for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 78,
            Self::NotFound(_) | Self::InvalidInput(_) => 64,
            Self::SourcesExhausted(_) => 69,
            Self::Storage(_) | Self::Io(_) => 74,
            _ => 70,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(Error::Config("db_path".into()).exit_code(), 78);
        assert_eq!(Error::NotFound("9999".into()).exit_code(), 64);
        assert_eq!(Error::InvalidInput("month 13".into()).exit_code(), 64);
        assert_eq!(Error::SourcesExhausted("probe".into()).exit_code(), 69);
        assert_eq!(Error::Storage("locked".into()).exit_code(), 74);
        assert_eq!(Error::Internal("boom".into()).exit_code(), 70);
    }
}
