//! Scanner plumbing: outbound scan requests and the inbound verdict loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Notify};

use starpack_core::{ScanRecord, ScanVerdict};
use starpack_store::{scan_store, SafetyGate, Scanner};

use crate::error::{join_err, DaemonError};

/// [`Scanner`] that hands paths to the external scanner over a channel.
#[derive(Clone)]
pub struct ScanQueue {
    tx: mpsc::UnboundedSender<PathBuf>,
}

impl ScanQueue {
    /// Queue plus the receiving end for the scanner.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PathBuf>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Scanner for ScanQueue {
    fn enqueue(&self, path: &Path) {
        if self.tx.send(path.to_path_buf()).is_err() {
            tracing::warn!(path = %path.display(), "scanner queue closed, scan request dropped");
        }
    }
}

/// Feed scanner verdicts into `gate` until shutdown or until the sender
/// side closes.
///
/// Each batch of verdicts is persisted under `store_dir`. A clean verdict
/// wakes `wake`, so gated content is retried without waiting for the
/// next periodic pass.
pub async fn consume_verdicts(
    gate: Arc<SafetyGate>,
    store_dir: PathBuf,
    mut verdicts: mpsc::Receiver<ScanRecord>,
    wake: Arc<Notify>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe = verdicts.recv() => {
                let Some(first) = maybe else { break };
                let mut clean = record(&gate, first);
                let mut batch = 1usize;
                while let Ok(next) = verdicts.try_recv() {
                    clean |= record(&gate, next);
                    batch += 1;
                }
                tracing::debug!(batch, "recorded scan verdicts");

                if let Err(err) = persist(gate.clone(), store_dir.clone()).await {
                    tracing::warn!(error = %err, "failed to persist scan records");
                }
                if clean {
                    wake.notify_one();
                }
            }
        }
    }
    persist(gate, store_dir).await
}

fn record(gate: &SafetyGate, record: ScanRecord) -> bool {
    let clean = record.verdict == ScanVerdict::Clean;
    gate.record(record);
    clean
}

async fn persist(gate: Arc<SafetyGate>, store_dir: PathBuf) -> Result<(), DaemonError> {
    tokio::task::spawn_blocking(move || {
        let file = scan_store::ScanStoreFile::from_records(gate.records());
        scan_store::save_at(&store_dir, &file)
    })
    .await
    .map_err(|e| join_err("scan store", e))?
    .map_err(DaemonError::from)
}
