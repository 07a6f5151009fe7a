use std::path::{Path, PathBuf};
use std::time::Duration;

/// Coalescing window for filesystem events on a remote pack.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Period of the catch-all reconciliation pass over every paired peer.
pub const RECONCILE_TICK: Duration = Duration::from_secs(2);

pub const CONFIG_FILE: &str = "starpack.yaml";

/// Mapping name registered with the mod surface for a category.
pub fn mapping_name(category: starpack_core::Category) -> String {
    format!("starpack-{category}")
}

pub fn config_path(state_root: &Path) -> PathBuf {
    state_root.join(CONFIG_FILE)
}

/// Directory holding `scan-records.json`.
pub fn scan_store_dir(state_root: &Path) -> PathBuf {
    state_root.join("scans")
}
