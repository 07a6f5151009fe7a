//! # starpack-store
//!
//! Content-addressed file storage, structural aggregate diffing and the
//! scan-verdict safety gate.
//!
//! [`ContentStore::put`] stores bytes under their SHA-256 name,
//! [`diff::aggregate_key`] gives every payload an order-independent key, and
//! [`SafetyGate::is_activatable`] decides whether a stored file may be used.

pub mod content_store;
pub mod diff;
pub mod error;
pub mod safety;
pub mod scan_store;

pub use content_store::{ContentStore, StoredContent, Verification};
pub use diff::{aggregate_key, redirect_delta, same_aggregate, AggregateDelta};
pub use error::StoreError;
pub use safety::{AlertSink, GateDecision, SafetyAlert, SafetyGate, Scanner};
