//! Domain types for star state exchange.
//!
//! Game paths, swap paths, extensions and content hashes are canonicalized
//! the same way everywhere: trimmed, `\` turned into `/`, ASCII-lowercased.
//! Constructors normalise. Documents read from remote packs go through
//! [`RedirectSet::canonicalized`] before they are keyed or applied, so
//! neither side has to trust the other.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DocumentError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Stable identity of a star (peer). Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identity of a data pack (a synchronized directory scope).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackId(pub String);

impl fmt::Display for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for PackId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PackId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// SHA-256 digest of stored content, as 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Parse a hex digest. Case is folded; anything but 64 hex chars fails.
    pub fn from_hex(hex: &str) -> Result<Self, DocumentError> {
        let folded = hex.trim().to_ascii_lowercase();
        if folded.len() != 64 || !folded.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DocumentError::InvalidHash(hex.to_string()));
        }
        Ok(Self(folded))
    }

    /// Hex form of a raw 256-bit digest.
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        Self(hex::encode(digest))
    }

    /// Filesystem-safe store name derived from the digest.
    pub fn file_name(&self) -> &str {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = DocumentError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> Self {
        h.0
    }
}

/// Canonical key of an aggregate payload; equal keys mean structurally
/// equal aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateKey(pub String);

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// One independently captured and applied slice of a star's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Category {
    /// Name, title and status effects.
    Basic,
    /// Appearance profile slot (body, skeleton scaling, animation set).
    Appearance(u8),
    Pose,
    /// Outfit: content redirects, path swaps and the manipulation blob.
    Redirects,
}

impl Category {
    /// Fixed document file name inside a pack's `Data` area.
    pub fn file_name(&self) -> String {
        format!("{self}.json")
    }

    /// Inverse of [`Category::file_name`]; `None` for foreign files and for
    /// spellings `file_name` would never produce (`appearance-01.json`).
    pub fn from_file_name(name: &str) -> Option<Self> {
        name.strip_suffix(".json")
            .and_then(|stem| stem.parse::<Category>().ok())
            .filter(|category| category.file_name() == name)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Basic => write!(f, "basic"),
            Category::Appearance(slot) => write!(f, "appearance-{slot}"),
            Category::Pose => write!(f, "pose"),
            Category::Redirects => write!(f, "redirects"),
        }
    }
}

impl FromStr for Category {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(Category::Basic),
            "pose" => Ok(Category::Pose),
            "redirects" => Ok(Category::Redirects),
            other => other
                .strip_prefix("appearance-")
                .and_then(|slot| slot.parse::<u8>().ok())
                .map(Category::Appearance)
                .ok_or_else(|| DocumentError::UnknownCategory(other.to_string())),
        }
    }
}

impl TryFrom<String> for Category {
    type Error = DocumentError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Category> for String {
    fn from(c: Category) -> Self {
        c.to_string()
    }
}

// ---------------------------------------------------------------------------
// Redirect set
// ---------------------------------------------------------------------------

/// Canonical form of a game or swap path.
pub fn normalize_path(path: &str) -> String {
    path.trim().replace('\\', "/").to_ascii_lowercase()
}

/// Canonical form of a file extension: lowercase with a leading dot.
pub fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_ascii_lowercase();
    if ext.is_empty() || ext.starts_with('.') {
        ext
    } else {
        format!(".{ext}")
    }
}

/// A stored content file and the game paths it replaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRedirect {
    pub hash: ContentHash,
    pub extension: String,
    pub game_paths: BTreeSet<String>,
}

impl ContentRedirect {
    /// Build a redirect with normalised, de-duplicated game paths. Empty
    /// paths are dropped.
    pub fn new<I, S>(hash: ContentHash, extension: &str, game_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hash,
            extension: normalize_extension(extension),
            game_paths: game_paths
                .into_iter()
                .map(|p| normalize_path(p.as_ref()))
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }
}

/// Direct path substitution not backed by stored content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSwap {
    pub source: String,
    pub target: String,
}

impl PathSwap {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: normalize_path(source),
            target: normalize_path(target),
        }
    }
}

/// The outfit aggregate: content redirects, swaps and an opaque
/// manipulation payload compared by exact equality.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RedirectSet {
    #[serde(default)]
    pub files: Vec<ContentRedirect>,
    #[serde(default)]
    pub swaps: Vec<PathSwap>,
    #[serde(default)]
    pub meta: String,
}

impl RedirectSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.swaps.is_empty() && self.meta.is_empty()
    }

    /// Number of (redirect, game path) pairs.
    pub fn game_path_count(&self) -> usize {
        self.files.iter().map(|f| f.game_paths.len()).sum()
    }

    /// Copy with every path and extension in canonical form. Redirects
    /// sharing `(hash, extension)` merge, redirects left without a game
    /// path drop out, and duplicate swaps collapse.
    pub fn canonicalized(&self) -> RedirectSet {
        let mut merged: BTreeMap<(ContentHash, String), BTreeSet<String>> = BTreeMap::new();
        for file in &self.files {
            let canonical = ContentRedirect::new(
                file.hash.clone(),
                &file.extension,
                file.game_paths.iter(),
            );
            merged
                .entry((canonical.hash, canonical.extension))
                .or_default()
                .extend(canonical.game_paths);
        }
        let swaps: BTreeSet<(String, String)> = self
            .swaps
            .iter()
            .map(|swap| PathSwap::new(&swap.source, &swap.target))
            .filter(|swap| !swap.source.is_empty())
            .map(|swap| (swap.source, swap.target))
            .collect();
        RedirectSet {
            files: merged
                .into_iter()
                .filter(|(_, paths)| !paths.is_empty())
                .map(|((hash, extension), game_paths)| ContentRedirect {
                    hash,
                    extension,
                    game_paths,
                })
                .collect(),
            swaps: swaps
                .into_iter()
                .map(|(source, target)| PathSwap { source, target })
                .collect(),
            meta: self.meta.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Other payloads
// ---------------------------------------------------------------------------

/// Name, title and active status effects of a star.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BasicState {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub status_effects: Vec<String>,
}

/// Opaque state exported by an external tool (appearance profile, pose).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateBlob {
    pub data: String,
}

/// Payload of one category document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregatePayload {
    Basic(BasicState),
    Appearance(StateBlob),
    Pose(StateBlob),
    Redirects(RedirectSet),
}

impl AggregatePayload {
    pub fn as_redirects(&self) -> Option<&RedirectSet> {
        match self {
            AggregatePayload::Redirects(set) => Some(set),
            _ => None,
        }
    }

    /// Redirect payloads in canonical form; other kinds unchanged.
    pub fn canonicalized(self) -> Self {
        match self {
            AggregatePayload::Redirects(set) => AggregatePayload::Redirects(set.canonicalized()),
            other => other,
        }
    }

    /// Whether this payload kind may be stored under `category`.
    pub fn fits(&self, category: Category) -> bool {
        matches!(
            (self, category),
            (AggregatePayload::Basic(_), Category::Basic)
                | (AggregatePayload::Appearance(_), Category::Appearance(_))
                | (AggregatePayload::Pose(_), Category::Pose)
                | (AggregatePayload::Redirects(_), Category::Redirects)
        )
    }
}

/// Versioned, timestamped snapshot of one category. Always replaced
/// whole, never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateDocument {
    pub version: u64,
    pub category: Category,
    pub published_at: DateTime<Utc>,
    pub payload: AggregatePayload,
}

// ---------------------------------------------------------------------------
// Scan records
// ---------------------------------------------------------------------------

/// Verdict of the external scanner for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanVerdict {
    #[default]
    Unknown,
    Clean,
    Infected,
}

/// Last known scan result for a file, keyed by its canonical path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub path: PathBuf,
    pub verdict: ScanVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malware_id: Option<String>,
    pub scan_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
