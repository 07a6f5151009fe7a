//! Structural, order-independent aggregate comparison.
//!
//! Every payload is reduced to a canonical form (sorted sets of normalised
//! entries) and hashed into an [`AggregateKey`]. Two aggregates are equal
//! iff their keys are equal, so the capture side can skip redundant
//! publication and the apply side can short-circuit unchanged peers with a
//! single string comparison.

use std::collections::BTreeSet;
use std::fmt;

use sha2::{Digest, Sha256};

use starpack_core::types::{normalize_extension, normalize_path};
use starpack_core::{AggregateKey, AggregatePayload, RedirectSet};

/// Canonical `(hash, extension, sorted game paths)` key of one redirect.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RedirectEntry {
    pub hash: String,
    pub extension: String,
    pub game_paths: Vec<String>,
}

/// Canonical `source -> target` key of one swap.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapEntry {
    pub source: String,
    pub target: String,
}

impl fmt::Display for SwapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.target)
    }
}

struct CanonicalRedirects<'a> {
    files: BTreeSet<RedirectEntry>,
    swaps: BTreeSet<SwapEntry>,
    meta: &'a str,
}

fn canonical_redirects(set: &RedirectSet) -> CanonicalRedirects<'_> {
    let files = set
        .files
        .iter()
        .map(|f| {
            let paths: BTreeSet<String> = f
                .game_paths
                .iter()
                .map(|p| normalize_path(p))
                .filter(|p| !p.is_empty())
                .collect();
            RedirectEntry {
                hash: f.hash.as_str().to_ascii_lowercase(),
                extension: normalize_extension(&f.extension),
                game_paths: paths.into_iter().collect(),
            }
        })
        .collect();
    let swaps = set
        .swaps
        .iter()
        .map(|s| SwapEntry {
            source: normalize_path(&s.source),
            target: normalize_path(&s.target),
        })
        .collect();
    CanonicalRedirects {
        files,
        swaps,
        meta: &set.meta,
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Length-prefixed field feed so no two canonical forms share a byte stream.
struct KeyHasher(Sha256);

impl KeyHasher {
    fn new(kind: &str) -> Self {
        let mut hasher = Self(Sha256::new());
        hasher.field(kind);
        hasher
    }

    fn field(&mut self, value: &str) {
        self.0.update((value.len() as u64).to_le_bytes());
        self.0.update(value.as_bytes());
    }

    fn count(&mut self, n: usize) {
        self.0.update((n as u64).to_le_bytes());
    }

    fn finish(self) -> AggregateKey {
        AggregateKey(hex::encode(self.0.finalize()))
    }
}

/// Order-independent key of a payload.
pub fn aggregate_key(payload: &AggregatePayload) -> AggregateKey {
    match payload {
        AggregatePayload::Basic(basic) => {
            let mut h = KeyHasher::new("basic");
            h.field(&basic.display_name);
            h.field(basic.title.as_deref().unwrap_or(""));
            let effects: BTreeSet<&str> = basic.status_effects.iter().map(String::as_str).collect();
            h.count(effects.len());
            for effect in effects {
                h.field(effect);
            }
            h.finish()
        }
        AggregatePayload::Appearance(blob) => {
            let mut h = KeyHasher::new("appearance");
            h.field(&blob.data);
            h.finish()
        }
        AggregatePayload::Pose(blob) => {
            let mut h = KeyHasher::new("pose");
            h.field(&blob.data);
            h.finish()
        }
        AggregatePayload::Redirects(set) => {
            let canonical = canonical_redirects(set);
            let mut h = KeyHasher::new("redirects");
            h.count(canonical.files.len());
            for entry in &canonical.files {
                h.field(&entry.hash);
                h.field(&entry.extension);
                h.count(entry.game_paths.len());
                for path in &entry.game_paths {
                    h.field(path);
                }
            }
            h.count(canonical.swaps.len());
            for swap in &canonical.swaps {
                h.field(&swap.source);
                h.field(&swap.target);
            }
            h.field(canonical.meta);
            h.finish()
        }
    }
}

/// Structural equality of two payloads.
pub fn same_aggregate(a: &AggregatePayload, b: &AggregatePayload) -> bool {
    aggregate_key(a) == aggregate_key(b)
}

// ---------------------------------------------------------------------------
// Delta
// ---------------------------------------------------------------------------

/// What changed between two redirect sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateDelta {
    pub added: Vec<RedirectEntry>,
    pub removed: Vec<RedirectEntry>,
    pub swaps_added: Vec<SwapEntry>,
    pub swaps_removed: Vec<SwapEntry>,
    pub meta_changed: bool,
}

impl AggregateDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.swaps_added.is_empty()
            && self.swaps_removed.is_empty()
            && !self.meta_changed
    }
}

impl fmt::Display for AggregateDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "+{} -{} redirects, +{} -{} swaps",
            self.added.len(),
            self.removed.len(),
            self.swaps_added.len(),
            self.swaps_removed.len()
        )?;
        if self.meta_changed {
            write!(f, ", meta changed")?;
        }
        Ok(())
    }
}

/// Entry-level difference from `old` to `new`. Empty iff the sets are equal.
pub fn redirect_delta(old: &RedirectSet, new: &RedirectSet) -> AggregateDelta {
    let old = canonical_redirects(old);
    let new = canonical_redirects(new);
    AggregateDelta {
        added: new.files.difference(&old.files).cloned().collect(),
        removed: old.files.difference(&new.files).cloned().collect(),
        swaps_added: new.swaps.difference(&old.swaps).cloned().collect(),
        swaps_removed: old.swaps.difference(&new.swaps).cloned().collect(),
        meta_changed: old.meta != new.meta,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
