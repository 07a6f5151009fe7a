//! Starpack daemon: capture scheduling, reconciliation and the runtime that
//! drives them.
//!
//! All reads of live host state and all calls into the mod-application
//! surface go through an [`Authority`] handle, which marshals closures onto
//! the single host-owned authoritative thread. Hashing, file I/O and
//! diffing run on tokio's blocking pool.

pub mod authority;
pub mod capture;
mod error;
pub mod paths;
pub mod reconcile;
mod runtime;
pub mod surface;
pub mod verdicts;
pub mod watcher;

pub use authority::{Authority, AuthorityQueue};
pub use capture::{
    CandidateFile, CaptureOutcome, CaptureRequest, CaptureScheduler, CaptureStart, CaptureTicket,
    LocalSnapshot, PendingCapture,
};
pub use error::DaemonError;
pub use reconcile::{ApplicationState, HostSurfaces, PassReport, Phase, ReconcileEngine};
pub use runtime::{init_tracing, Host, Runtime, RuntimeOptions, ScannerLink};
pub use surface::{
    LiveTargets, LocalState, ModSurface, OverlayId, PathMap, StateSurface, SurfaceError, TargetId,
};
pub use verdicts::{consume_verdicts, ScanQueue};
pub use watcher::{watch_packs, WatchCommand};
