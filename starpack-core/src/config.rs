//! Pipeline configuration.
//!
//! Loaded from a YAML file with [`PipelineConfig::load_at`]; every field has
//! a default, so a missing file or a partial file is fine.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, DocumentError};
use crate::types::normalize_extension;

const AUDIO_EXTENSIONS: &[&str] = &[".scd"];
const ANIMATION_EXTENSIONS: &[&str] = &[".pap", ".tmb"];
const VFX_EXTENSIONS: &[&str] = &[".avfx", ".atex"];

const DEFAULT_ALLOWED: &[&str] = &[
    ".mdl", ".tex", ".mtrl", ".sklb", ".skp", ".eid", ".phyb", ".pbd", ".shpk",
];
const DEFAULT_EXCLUDED: &[&str] = &[".exe", ".dll", ".bat", ".ps1", ".lnk", ".imc"];

/// Which optional content categories the local star shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    pub sounds: bool,
    pub animations: bool,
    pub vfx: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            sounds: false,
            animations: true,
            vfx: true,
        }
    }
}

impl Permissions {
    /// Flags granted by both `self` and `ceiling`.
    pub fn restricted_to(self, ceiling: Permissions) -> Permissions {
        Permissions {
            sounds: self.sounds && ceiling.sounds,
            animations: self.animations && ceiling.animations,
            vfx: self.vfx && ceiling.vfx,
        }
    }
}

/// Extension allow-list and deny-list for captured content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionPolicy {
    pub allowed: BTreeSet<String>,
    pub excluded: BTreeSet<String>,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            allowed: DEFAULT_ALLOWED.iter().map(|e| e.to_string()).collect(),
            excluded: DEFAULT_EXCLUDED.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl AdmissionPolicy {
    /// Whether a file with extension `ext` may be captured.
    ///
    /// Excluded wins over everything. Audio, animation and VFX files need
    /// their permission flag. Anything else must be on the allow-list.
    pub fn admits(&self, ext: &str, permissions: Permissions) -> bool {
        let ext = normalize_extension(ext);
        if ext.is_empty() || self.excluded.contains(&ext) {
            return false;
        }
        let ext = ext.as_str();
        if AUDIO_EXTENSIONS.contains(&ext) {
            return permissions.sounds;
        }
        if ANIMATION_EXTENSIONS.contains(&ext) {
            return permissions.animations;
        }
        if VFX_EXTENSIONS.contains(&ext) {
            return permissions.vfx;
        }
        self.allowed.contains(ext)
    }
}

/// Tunables for capture, reconciliation and the safety gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub min_capture_interval_ms: u64,
    pub min_reconcile_interval_ms: u64,
    pub scanning_enabled: bool,
    /// Operator ceiling on shared content; a snapshot's own flags are
    /// narrowed to it before admission.
    pub permissions: Permissions,
    pub extensions: AdmissionPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_capture_interval_ms: 500,
            min_reconcile_interval_ms: 1000,
            scanning_enabled: true,
            permissions: Permissions::default(),
            extensions: AdmissionPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load_at(path: &Path) -> Result<Self, DocumentError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        serde_yaml::from_str(&contents).map_err(|e| DocumentError::Config {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn min_capture_interval(&self) -> Duration {
        Duration::from_millis(self.min_capture_interval_ms)
    }

    pub fn min_reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.min_reconcile_interval_ms)
    }

    /// Config with both throttles disabled.
    pub fn unthrottled() -> Self {
        Self {
            min_capture_interval_ms: 0,
            min_reconcile_interval_ms: 0,
            ..Self::default()
        }
    }
}
