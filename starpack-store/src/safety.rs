//! Safety gate: only content with a fresh `Clean` verdict may be activated.
//!
//! A verdict is fresh while its scan time is not older than the file's
//! current modification time. Anything else (no record, `Unknown`,
//! `Infected`, stale `Clean`) is refused and handed to the scanner, at most
//! once while a scan for that path is outstanding. The first refusal of a
//! path raises a single operator alert for the lifetime of the gate.
//!
//! Verdicts arrive asynchronously through [`SafetyGate::record`]; callers
//! never poll.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use starpack_core::{PackId, ScanRecord, ScanVerdict};

/// External malware scanner. `enqueue` must not block.
pub trait Scanner: Send + Sync {
    fn enqueue(&self, path: &Path);
}

/// Receiver of operator-visible safety alerts.
pub trait AlertSink: Send + Sync {
    fn alert(&self, alert: &SafetyAlert);
}

/// One refused file, reported once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyAlert {
    pub path: PathBuf,
    /// Pack the refused content came from.
    pub pack: PackId,
    pub decision: GateDecision,
    pub malware_id: Option<String>,
}

/// Why a path was (not) activatable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Activatable,
    /// No verdict yet, `Unknown`, or a `Clean` verdict older than the file.
    Unverified,
    Infected,
    /// The file could not be stat'ed.
    Unreadable,
}

#[derive(Default)]
struct GateState {
    records: HashMap<PathBuf, ScanRecord>,
    queued: HashSet<PathBuf>,
    alerted: HashSet<PathBuf>,
}

/// Per-file verdict tracker in front of the external scanner.
pub struct SafetyGate {
    scanner: Arc<dyn Scanner>,
    alerts: Arc<dyn AlertSink>,
    state: Mutex<GateState>,
}

impl SafetyGate {
    pub fn new(scanner: Arc<dyn Scanner>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            scanner,
            alerts,
            state: Mutex::new(GateState::default()),
        }
    }

    /// Gate seeded with previously persisted records.
    pub fn with_records(
        scanner: Arc<dyn Scanner>,
        alerts: Arc<dyn AlertSink>,
        records: impl IntoIterator<Item = ScanRecord>,
    ) -> Self {
        let gate = Self::new(scanner, alerts);
        {
            let mut state = gate.lock();
            for record in records {
                state.records.insert(canonical(&record.path), record);
            }
        }
        gate
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `path` may be activated. See [`SafetyGate::evaluate`].
    pub fn is_activatable(&self, path: &Path, pack: &PackId, scanning_enabled: bool) -> bool {
        self.evaluate(path, pack, scanning_enabled) == GateDecision::Activatable
    }

    /// Decide on `path`, enqueueing and alerting as side effects.
    pub fn evaluate(&self, path: &Path, pack: &PackId, scanning_enabled: bool) -> GateDecision {
        if !scanning_enabled {
            return GateDecision::Activatable;
        }

        let key = canonical(path);
        let modified = match std::fs::metadata(&key).and_then(|m| m.modified()) {
            Ok(time) => DateTime::<Utc>::from(time),
            Err(err) => {
                tracing::warn!("cannot stat {} for scan gating: {}", key.display(), err);
                return GateDecision::Unreadable;
            }
        };

        let (decision, malware_id, enqueue, alert) = {
            let mut state = self.lock();
            let (decision, malware_id) = match state.records.get(&key) {
                Some(record) => (decide(record, modified), record.malware_id.clone()),
                None => (GateDecision::Unverified, None),
            };
            if decision == GateDecision::Activatable {
                return decision;
            }
            let enqueue = state.queued.insert(key.clone());
            let alert = state.alerted.insert(key.clone());
            (decision, malware_id, enqueue, alert)
        };

        if enqueue {
            tracing::debug!("queueing {} for scan", key.display());
            self.scanner.enqueue(&key);
        }
        if alert {
            tracing::warn!(
                "refusing unverified content {} from pack {} ({:?})",
                key.display(),
                pack,
                decision
            );
            self.alerts.alert(&SafetyAlert {
                path: key,
                pack: pack.clone(),
                decision,
                malware_id,
            });
        }
        decision
    }

    /// Store a scan result delivered by the scanner.
    pub fn record(&self, record: ScanRecord) {
        let key = canonical(&record.path);
        if record.verdict == ScanVerdict::Infected {
            tracing::warn!(
                "scanner flagged {} as infected ({})",
                key.display(),
                record.malware_id.as_deref().unwrap_or("unnamed")
            );
        }
        let mut state = self.lock();
        state.queued.remove(&key);
        state.records.insert(key, record);
    }

    /// Current record for `path`, if any.
    pub fn record_for(&self, path: &Path) -> Option<ScanRecord> {
        self.lock().records.get(&canonical(path)).cloned()
    }

    /// Copy of every record, for persistence.
    pub fn records(&self) -> Vec<ScanRecord> {
        self.lock().records.values().cloned().collect()
    }

    /// Number of paths handed to the scanner and not yet answered.
    pub fn pending_scans(&self) -> usize {
        self.lock().queued.len()
    }
}

fn decide(record: &ScanRecord, modified: DateTime<Utc>) -> GateDecision {
    match record.verdict {
        ScanVerdict::Infected => GateDecision::Infected,
        ScanVerdict::Unknown => GateDecision::Unverified,
        ScanVerdict::Clean if record.scan_time >= modified => GateDecision::Activatable,
        ScanVerdict::Clean => GateDecision::Unverified,
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
