//! Error types for starpack-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from document and config operations.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// Underlying I/O failure, with the path that was being touched.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error (write/save path).
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Parse error on load, with the file path.
    #[error("failed to parse document at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Pipeline config YAML could not be parsed.
    #[error("failed to parse config at {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The document file did not exist at the expected path.
    #[error("document not found at {path}")]
    NotFound { path: PathBuf },

    /// A category name read from disk or the command line is not recognised.
    #[error("unknown category '{0}'")]
    UnknownCategory(String),

    /// A content hash string is not 64 hex characters.
    #[error("invalid content hash '{0}'")]
    InvalidHash(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DocumentError {
    DocumentError::Io {
        path: path.into(),
        source,
    }
}
