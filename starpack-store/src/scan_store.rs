//! Persisted scanner verdicts.
//!
//! `<dir>/scan-records.json` holds every conclusive verdict (`Clean` or
//! `Infected`) so a restart does not rescan unchanged content. `Unknown`
//! verdicts are not worth keeping: the gate re-enqueues those paths anyway.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use starpack_core::{ScanRecord, ScanVerdict};

use crate::error::{io_err, StoreError};

pub const SCAN_STORE_FILE: &str = "scan-records.json";

/// Current on-disk layout.
pub const SCAN_STORE_FORMAT: u32 = 1;

/// Verdicts as written to disk, sorted by path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanStoreFile {
    pub format: u32,
    pub saved_at: DateTime<Utc>,
    pub records: Vec<ScanRecord>,
}

impl ScanStoreFile {
    /// Snapshot of `records`, keeping conclusive verdicts only.
    pub fn from_records(records: impl IntoIterator<Item = ScanRecord>) -> Self {
        let mut records: Vec<ScanRecord> = records
            .into_iter()
            .filter(|r| r.verdict != ScanVerdict::Unknown)
            .collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            format: SCAN_STORE_FORMAT,
            saved_at: Utc::now(),
            records,
        }
    }

    pub fn into_records(self) -> Vec<ScanRecord> {
        self.records
    }
}

pub fn store_path_at(dir: &Path) -> PathBuf {
    dir.join(SCAN_STORE_FILE)
}

/// Verdicts saved under `dir`; none when nothing was saved yet.
pub fn load_at(dir: &Path) -> Result<ScanStoreFile, StoreError> {
    let path = store_path_at(dir);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ScanStoreFile::from_records([]))
        }
        Err(err) => return Err(io_err(&path, err)),
    };
    let file: ScanStoreFile = serde_json::from_str(&contents)?;
    tracing::debug!("loaded {} scan verdicts from {}", file.records.len(), path.display());
    Ok(file)
}

/// Replace the verdicts under `dir` (temp file + rename).
pub fn save_at(dir: &Path, file: &ScanStoreFile) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let path = store_path_at(dir);
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(file)?).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}
