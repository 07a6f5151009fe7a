use std::path::PathBuf;

use thiserror::Error;

use starpack_core::PeerId;

/// Error surface for the capture scheduler, reconciler and runtime.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("document error: {0}")]
    Document(#[from] starpack_core::DocumentError),

    #[error("store error: {0}")]
    Store(#[from] starpack_store::StoreError),

    #[error("surface error: {0}")]
    Surface(#[from] crate::surface::SurfaceError),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("{task} task join failure: {message}")]
    Join { task: &'static str, message: String },

    #[error("peer '{0}' is not paired")]
    UnknownPeer(PeerId),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn join_err(task: &'static str, err: tokio::task::JoinError) -> DaemonError {
    DaemonError::Join {
        task,
        message: err.to_string(),
    }
}
