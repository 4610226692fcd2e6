//! Error types for the configuration store.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur in the configuration store.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Filesystem error against the transaction log.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path the operation touched.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A transaction log line could not be decoded.
    #[error("corrupt transaction log at {path} line {line}: {reason}")]
    CorruptTlog {
        /// Log file path.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// Decoder diagnostic.
        reason: String,
    },

    /// A path addressed a leaf as if it were an interior node (or vice
    /// versa).
    #[error("path '{path}' conflicts with an existing node")]
    PathConflict {
        /// The offending path, slash-joined.
        path: String,
    },

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
