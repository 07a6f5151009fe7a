use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use starpack_core::{Category, PackId, PackRoots, PathResolver, PeerId, PipelineConfig, ScanRecord};
use starpack_store::{scan_store, AlertSink, SafetyGate};

use crate::authority::Authority;
use crate::capture::{CaptureRequest, CaptureScheduler};
use crate::error::{join_err, DaemonError};
use crate::paths::{config_path, scan_store_dir, RECONCILE_TICK};
use crate::reconcile::{HostSurfaces, PassReport, ReconcileEngine};
use crate::surface::LocalState;
use crate::verdicts::{consume_verdicts, ScanQueue};
use crate::watcher::{watch_packs, WatchCommand};

/// Where the runtime keeps its own state and which pack it publishes to.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Holds `starpack.yaml` and the persisted scan records.
    pub state_root: PathBuf,
    /// The local star's pack.
    pub local_pack: PackId,
    /// Overrides `starpack.yaml` when set.
    pub config: Option<PipelineConfig>,
    pub reconcile_tick: std::time::Duration,
}

impl RuntimeOptions {
    pub fn new(state_root: impl Into<PathBuf>, local_pack: PackId) -> Self {
        Self {
            state_root: state_root.into(),
            local_pack,
            config: None,
            reconcile_tick: RECONCILE_TICK,
        }
    }
}

/// Collaborators supplied by the host process.
#[derive(Clone)]
pub struct Host {
    pub authority: Authority,
    pub local: Arc<dyn LocalState>,
    pub surfaces: HostSurfaces,
    pub resolver: Arc<dyn PathResolver>,
    pub alerts: Arc<dyn AlertSink>,
}

/// The host's end of the scanner link.
pub struct ScannerLink {
    /// Paths the safety gate wants scanned.
    pub requests: mpsc::UnboundedReceiver<PathBuf>,
    /// Where the scanner delivers verdicts.
    pub verdicts: mpsc::Sender<ScanRecord>,
}

enum ReconcileCommand {
    Pair {
        peer: PeerId,
        pack: PackId,
        respond_to: oneshot::Sender<()>,
    },
    Unpair {
        peer: PeerId,
        respond_to: oneshot::Sender<Result<bool, DaemonError>>,
    },
    Reconcile {
        peer: Option<PeerId>,
        respond_to: oneshot::Sender<Result<Vec<PassReport>, DaemonError>>,
    },
}

/// Running pipeline: capture scheduler plus the reconcile, watcher and
/// verdict tasks.
pub struct Runtime {
    capture: CaptureScheduler,
    commands: mpsc::Sender<ReconcileCommand>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<Result<(), DaemonError>>)>,
}

impl Runtime {
    /// Load config and scan records, then spawn the background tasks. Must
    /// be called inside a tokio runtime.
    pub fn start(options: RuntimeOptions, host: Host) -> Result<(Runtime, ScannerLink), DaemonError> {
        let config = match options.config {
            Some(config) => config,
            None => PipelineConfig::load_at(&config_path(&options.state_root))?,
        };
        let scans_dir = scan_store_dir(&options.state_root);
        let records = scan_store::load_at(&scans_dir)?.into_records();
        tracing::info!(
            records = records.len(),
            scanning = config.scanning_enabled,
            "starting starpack runtime"
        );

        let (scan_queue, scan_requests) = ScanQueue::channel();
        let gate = Arc::new(SafetyGate::with_records(
            Arc::new(scan_queue),
            host.alerts.clone(),
            records,
        ));

        let local_roots = match host.resolver.resolve(&options.local_pack) {
            Some(roots) => roots,
            None => {
                let roots = PackRoots::under(&options.state_root.join(&options.local_pack.0));
                tracing::warn!(
                    pack = %options.local_pack,
                    path = %roots.data.display(),
                    "local pack not resolvable, publishing under the state root"
                );
                roots
            }
        };
        let capture = CaptureScheduler::open(
            &local_roots,
            host.local.clone(),
            host.authority.clone(),
            config.clone(),
        )?;

        let engine = ReconcileEngine::new(
            host.authority.clone(),
            host.resolver.clone(),
            gate.clone(),
            host.surfaces.clone(),
            config,
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(16);
        let (command_tx, command_rx) = mpsc::channel::<ReconcileCommand>(64);
        let (verdict_tx, verdict_rx) = mpsc::channel::<ScanRecord>(256);
        let (watch_tx, watch_rx) = mpsc::unbounded_channel::<WatchCommand>();
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel::<PeerId>();
        let wake = Arc::new(Notify::new());

        let mut tasks = Vec::new();

        tasks.push(("watcher", {
            let shutdown = shutdown_tx.clone();
            tokio::spawn(async move {
                let result = watch_packs(watch_rx, trigger_tx, shutdown.subscribe()).await;
                if let Err(err) = &result {
                    tracing::error!(error = %err, "pack watcher stopped");
                }
                result
            })
        }));

        tasks.push(("verdicts", {
            let shutdown = shutdown_tx.clone();
            let gate = gate.clone();
            let wake = wake.clone();
            tokio::spawn(async move {
                consume_verdicts(gate, scans_dir, verdict_rx, wake, shutdown.subscribe()).await
            })
        }));

        tasks.push(("reconcile", {
            let shutdown = shutdown_tx.clone();
            let resolver = host.resolver.clone();
            let tick = options.reconcile_tick;
            tokio::spawn(async move {
                reconcile_task(
                    engine,
                    resolver,
                    tick,
                    command_rx,
                    trigger_rx,
                    watch_tx,
                    wake,
                    shutdown.subscribe(),
                )
                .await
            })
        }));

        Ok((
            Runtime {
                capture,
                commands: command_tx,
                shutdown: shutdown_tx,
                tasks,
            },
            ScannerLink {
                requests: scan_requests,
                verdicts: verdict_tx,
            },
        ))
    }

    pub fn capture(&self) -> &CaptureScheduler {
        &self.capture
    }

    /// Capture `category` of the local star. See
    /// [`CaptureScheduler::request_capture`].
    pub async fn request_capture(&self, category: Category) -> Result<CaptureRequest, DaemonError> {
        self.capture.request_capture(category).await
    }

    pub async fn pair(&self, peer: PeerId, pack: PackId) -> Result<(), DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.send(ReconcileCommand::Pair {
            peer,
            pack,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| DaemonError::ChannelClosed("reconcile response"))
    }

    /// Returns whether the peer was paired.
    pub async fn unpair(&self, peer: PeerId) -> Result<bool, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.send(ReconcileCommand::Unpair {
            peer,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| DaemonError::ChannelClosed("reconcile response"))?
    }

    pub async fn reconcile(&self, peer: PeerId) -> Result<PassReport, DaemonError> {
        let mut reports = self.reconcile_request(Some(peer.clone())).await?;
        reports.pop().ok_or(DaemonError::UnknownPeer(peer))
    }

    pub async fn reconcile_all(&self) -> Result<Vec<PassReport>, DaemonError> {
        self.reconcile_request(None).await
    }

    async fn reconcile_request(&self, peer: Option<PeerId>) -> Result<Vec<PassReport>, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.send(ReconcileCommand::Reconcile {
            peer,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| DaemonError::ChannelClosed("reconcile response"))?
    }

    async fn send(&self, command: ReconcileCommand) -> Result<(), DaemonError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DaemonError::ChannelClosed("reconcile queue"))
    }

    /// Stop every task and wait for them. Scan records are persisted on the
    /// way out.
    pub async fn shutdown(self) -> Result<(), DaemonError> {
        let _ = self.shutdown.send(());
        let mut first_err = None;
        for (task, handle) in self.tasks {
            if let Err(err) = handle_join(task, handle.await) {
                tracing::error!(task, error = %err, "task ended with error");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[allow(clippy::too_many_arguments)]
async fn reconcile_task(
    mut engine: ReconcileEngine,
    resolver: Arc<dyn PathResolver>,
    tick: std::time::Duration,
    mut commands: mpsc::Receiver<ReconcileCommand>,
    mut triggers: mpsc::UnboundedReceiver<PeerId>,
    watch_tx: mpsc::UnboundedSender<WatchCommand>,
    wake: Arc<Notify>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;
    let mut watcher_open = true;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    ReconcileCommand::Pair { peer, pack, respond_to } => {
                        if let Some(roots) = resolver.resolve(&pack) {
                            let _ = watch_tx.send(WatchCommand::Add(peer.clone(), roots.data));
                        }
                        engine.pair(peer, pack);
                        let _ = respond_to.send(());
                    }
                    ReconcileCommand::Unpair { peer, respond_to } => {
                        let _ = watch_tx.send(WatchCommand::Remove(peer.clone()));
                        let _ = respond_to.send(engine.unpair(&peer).await);
                    }
                    ReconcileCommand::Reconcile { peer: Some(peer), respond_to } => {
                        let _ = respond_to.send(engine.reconcile(&peer).await.map(|r| vec![r]));
                    }
                    ReconcileCommand::Reconcile { peer: None, respond_to } => {
                        let _ = respond_to.send(Ok(engine.reconcile_all().await));
                    }
                }
            }
            peer = triggers.recv(), if watcher_open => {
                let Some(peer) = peer else {
                    watcher_open = false;
                    continue;
                };
                if !engine.is_paired(&peer) {
                    continue;
                }
                if let Err(err) = engine.reconcile(&peer).await {
                    tracing::error!(%peer, error = %err, "watcher-triggered reconciliation failed");
                }
            }
            _ = wake.notified() => {
                engine.reconcile_all().await;
            }
            _ = interval.tick() => {
                engine.reconcile_all().await;
            }
        }
    }
    Ok(())
}

fn handle_join(
    task: &'static str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(join_err(task, err)),
    }
}

/// Install the global subscriber. `RUST_LOG` filters, default `info`.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = if json {
        fmt().json().with_env_filter(filter).with_target(false).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}
