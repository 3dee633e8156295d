//! Error types for storage operations.

use thiserror::Error;

use clip_format::FormatError;

/// Errors that can occur while serving archive bytes.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Object not found in remote storage.
    #[error("object not found: s3://{bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Local disk I/O failed.
    #[error("I/O error at {path}: {message}")]
    Io { path: String, message: String },

    /// Remote request failed.
    #[error("network error for {key}: {message}")]
    Network { key: String, message: String },

    /// Remote request exceeded its deadline.
    #[error("request timed out after {seconds}s: {key}")]
    Timeout { key: String, seconds: u64 },

    /// Unrecognized archive scheme or missing configuration.
    #[error("backend error: {message}")]
    Backend { message: String },

    /// The archive itself is invalid.
    #[error(transparent)]
    Format(#[from] FormatError),
}

impl StorageError {
    /// Wrap a local I/O error with the path it occurred at.
    pub fn io(path: impl Into<String>, err: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Build a `Backend` error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}
