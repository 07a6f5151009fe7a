//! Error types for starpack-store.

use std::path::PathBuf;

use thiserror::Error;

use starpack_core::{ContentHash, DocumentError};

/// All errors that can arise from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An error from document or config persistence.
    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (scan record store).
    #[error("scan store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No stored file exists for the requested digest.
    #[error("content {hash} not found in store")]
    NotFound { hash: ContentHash },
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
