//! Host collaborators consumed by the scheduler and the reconciler.
//!
//! Every method here is only ever called on the authoritative thread,
//! through [`crate::Authority::run`].

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use starpack_core::{AggregatePayload, Category, PeerId};

use crate::capture::LocalSnapshot;

/// Overlay handle issued by the mod surface, stable per peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OverlayId(pub String);

impl fmt::Display for OverlayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host handle of a live in-world representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(pub u32);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Failure reported by a host collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SurfaceError(pub String);

impl SurfaceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Game path to replacement path (a content-store file or a swap target).
pub type PathMap = BTreeMap<String, String>;

/// External mod-application surface.
pub trait ModSurface: Send + Sync {
    fn create_overlay(&self, owner: &PeerId) -> Result<OverlayId, SurfaceError>;

    /// Removing a mapping that was never added is not an error.
    fn remove_mapping(&self, name: &str, overlay: &OverlayId) -> Result<(), SurfaceError>;

    fn add_mapping(
        &self,
        name: &str,
        overlay: &OverlayId,
        paths: &PathMap,
        meta: &str,
    ) -> Result<(), SurfaceError>;

    fn assign_overlay(&self, overlay: &OverlayId, target: TargetId) -> Result<(), SurfaceError>;

    fn refresh(&self, target: TargetId) -> Result<(), SurfaceError>;
}

/// Applies the non-redirect categories (basic state, appearance profiles,
/// pose) to a live target.
pub trait StateSurface: Send + Sync {
    /// Apply `payload`. May return the id of a profile the host assigned.
    fn apply_state(
        &self,
        target: TargetId,
        category: Category,
        payload: &AggregatePayload,
    ) -> Result<Option<String>, SurfaceError>;

    fn revert_state(&self, target: TargetId, category: Category) -> Result<(), SurfaceError>;
}

/// Reader of the local star's live state.
pub trait LocalState: Send + Sync {
    /// `None` when nothing usable can be read (e.g. no local entity).
    fn snapshot(&self, category: Category) -> Option<LocalSnapshot>;
}

/// Lookup of live targets for remote stars.
pub trait LiveTargets: Send + Sync {
    fn locate(&self, peer: &PeerId) -> Option<TargetId>;
}
