//! Starpack core library: domain types, aggregate document persistence,
//! pack layout and pipeline configuration.
//!
//! - [`types`]: identities, categories, redirect sets, scan records
//! - [`document`]: load / save of per-category aggregate documents
//! - [`pack`]: `Data` / `Files` resolution for a data pack
//! - [`config`]: [`PipelineConfig`] and extension admission
//! - [`error`]: [`DocumentError`]

pub mod config;
pub mod document;
pub mod error;
pub mod pack;
pub mod types;

pub use config::{AdmissionPolicy, Permissions, PipelineConfig};
pub use error::DocumentError;
pub use pack::{DirectoryResolver, PackRoots, PathResolver};
pub use types::{
    AggregateDocument, AggregateKey, AggregatePayload, BasicState, Category, ContentHash,
    ContentRedirect, PackId, PathSwap, PeerId, RedirectSet, ScanRecord, ScanVerdict, StateBlob,
};
