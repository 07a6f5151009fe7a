//! Capture & coalescing scheduler for the local star.
//!
//! ## Capture protocol (per category)
//!
//! 1. Requests closer together than `min_capture_interval` are dropped.
//! 2. Snapshot the live state on the authoritative thread.
//! 3. Bump the category generation and cancel the in-flight compute.
//! 4. On the blocking pool: admit, hash and store every candidate file,
//!    checking the cancellation token before each one.
//! 5. Under the lane lock, re-check generation and token, compare with the
//!    last published aggregate and, if it differs, swap the in-memory
//!    reference and write the category document.
//!
//! Step 5 runs with the lane locked, so a newer generation can neither be
//! published before an older one nor be overwritten by it on disk.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use starpack_core::types::normalize_extension;
use starpack_core::{
    document, AggregateDocument, AggregateKey, AggregatePayload, Category, ContentHash,
    ContentRedirect, PackRoots, PathSwap, Permissions, PipelineConfig, RedirectSet,
};
use starpack_store::{aggregate_key, ContentStore};

use crate::authority::Authority;
use crate::error::{join_err, DaemonError};
use crate::surface::LocalState;

/// A local file currently replacing one or more game paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFile {
    pub source: PathBuf,
    pub extension: String,
    pub game_paths: Vec<String>,
}

impl CandidateFile {
    /// Candidate whose extension is taken from its first game path, or from
    /// `source` when it has none.
    pub fn new<I, S>(source: impl Into<PathBuf>, game_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let source = source.into();
        let game_paths: Vec<String> = game_paths.into_iter().map(Into::into).collect();
        let extension = game_paths
            .first()
            .and_then(|p| Path::new(p.as_str()).extension())
            .or_else(|| source.extension())
            .and_then(|e| e.to_str())
            .map(normalize_extension)
            .unwrap_or_default();
        Self {
            source,
            extension,
            game_paths,
        }
    }
}

/// Immutable view of local state taken on the authoritative thread.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalSnapshot {
    Redirects {
        files: Vec<CandidateFile>,
        swaps: Vec<PathSwap>,
        meta: String,
        permissions: Permissions,
    },
    State(AggregatePayload),
}

/// Result of a finished compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Published { version: u64 },
    /// Equal to the last published aggregate; nothing written.
    Unchanged,
    /// A newer capture was requested; result discarded.
    Stale,
    /// The document could not be written or did not fit the category.
    Failed,
}

/// Result of [`CaptureScheduler::begin_capture`].
#[derive(Debug)]
pub enum CaptureStart {
    Debounced,
    NoState,
    Ready(PendingCapture),
}

/// Result of [`CaptureScheduler::request_capture`].
#[derive(Debug)]
pub enum CaptureRequest {
    Debounced,
    NoState,
    Scheduled(CaptureTicket),
}

/// A snapshot tagged with its generation, waiting for compute.
#[derive(Debug)]
pub struct PendingCapture {
    lane: Arc<Lane>,
    generation: u64,
    token: CancellationToken,
    snapshot: LocalSnapshot,
}

impl PendingCapture {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn category(&self) -> Category {
        self.lane.category
    }
}

/// Handle to a running compute.
#[derive(Debug)]
pub struct CaptureTicket {
    pub category: Category,
    pub generation: u64,
    handle: JoinHandle<CaptureOutcome>,
}

impl CaptureTicket {
    pub async fn outcome(self) -> Result<CaptureOutcome, DaemonError> {
        self.handle.await.map_err(|e| join_err("capture", e))
    }
}

#[derive(Debug)]
struct LaneState {
    generation: u64,
    cancel: CancellationToken,
    last_request: Option<Instant>,
    last_published: Option<Arc<AggregateDocument>>,
    last_key: Option<AggregateKey>,
}

#[derive(Debug)]
struct Lane {
    category: Category,
    /// Serializes snapshot + generation bump for one category.
    begin: tokio::sync::Mutex<()>,
    state: Mutex<LaneState>,
}

impl Lane {
    fn new(category: Category, published: Option<AggregateDocument>) -> Self {
        let last_key = published.as_ref().map(|doc| aggregate_key(&doc.payload));
        Self {
            category,
            begin: tokio::sync::Mutex::new(()),
            state: Mutex::new(LaneState {
                generation: 0,
                cancel: CancellationToken::new(),
                last_request: None,
                last_published: published.map(Arc::new),
                last_key,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Inner {
    local: Arc<dyn LocalState>,
    authority: Authority,
    store: ContentStore,
    data_root: PathBuf,
    config: PipelineConfig,
    lanes: Mutex<HashMap<Category, Arc<Lane>>>,
}

/// Per-category capture cadence and publication for the local pack.
#[derive(Clone)]
pub struct CaptureScheduler {
    inner: Arc<Inner>,
}

impl CaptureScheduler {
    /// Scheduler publishing into `roots`. Documents already on disk become
    /// the last published aggregates, so an unchanged restart writes
    /// nothing.
    pub fn open(
        roots: &PackRoots,
        local: Arc<dyn LocalState>,
        authority: Authority,
        config: PipelineConfig,
    ) -> Result<Self, DaemonError> {
        let mut lanes = HashMap::new();
        for category in document::list_categories_at(&roots.data)? {
            match document::load_at(&roots.data, category) {
                Ok(doc) => {
                    lanes.insert(category, Arc::new(Lane::new(category, Some(doc))));
                }
                Err(err) => {
                    tracing::warn!(%category, error = %err, "ignoring unreadable local document");
                }
            }
        }
        Ok(Self {
            inner: Arc::new(Inner {
                local,
                authority,
                store: ContentStore::new(&roots.files),
                data_root: roots.data.clone(),
                config,
                lanes: Mutex::new(lanes),
            }),
        })
    }

    fn lane(&self, category: Category) -> Arc<Lane> {
        let mut lanes = self
            .inner
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        lanes
            .entry(category)
            .or_insert_with(|| Arc::new(Lane::new(category, None)))
            .clone()
    }

    /// Current capture generation of `category` (0 before the first capture).
    pub fn generation(&self, category: Category) -> u64 {
        self.lane(category).lock().generation
    }

    pub fn last_published(&self, category: Category) -> Option<Arc<AggregateDocument>> {
        self.lane(category).lock().last_published.clone()
    }

    /// Snapshot and schedule compute in one step.
    pub async fn request_capture(&self, category: Category) -> Result<CaptureRequest, DaemonError> {
        Ok(match self.begin_capture(category).await? {
            CaptureStart::Debounced => CaptureRequest::Debounced,
            CaptureStart::NoState => CaptureRequest::NoState,
            CaptureStart::Ready(pending) => CaptureRequest::Scheduled(self.spawn_compute(pending)),
        })
    }

    /// Snapshot phase. Invalidates every earlier generation of the category.
    pub async fn begin_capture(&self, category: Category) -> Result<CaptureStart, DaemonError> {
        let lane = self.lane(category);
        let _serial = lane.begin.lock().await;

        let now = Instant::now();
        {
            let mut state = lane.lock();
            if let Some(last) = state.last_request {
                if now.duration_since(last) < self.inner.config.min_capture_interval() {
                    return Ok(CaptureStart::Debounced);
                }
            }
            state.last_request = Some(now);
        }

        let local = self.inner.local.clone();
        let snapshot = self
            .inner
            .authority
            .run(move || local.snapshot(category))
            .await?;
        let Some(snapshot) = snapshot else {
            tracing::debug!(%category, "no local state to capture");
            return Ok(CaptureStart::NoState);
        };

        let (generation, token) = {
            let mut state = lane.lock();
            state.cancel.cancel();
            state.generation += 1;
            state.cancel = CancellationToken::new();
            (state.generation, state.cancel.clone())
        };
        tracing::debug!(%category, generation, "capture snapshot taken");

        Ok(CaptureStart::Ready(PendingCapture {
            lane: lane.clone(),
            generation,
            token,
            snapshot,
        }))
    }

    /// Compute phase, on the blocking pool.
    pub fn spawn_compute(&self, pending: PendingCapture) -> CaptureTicket {
        let category = pending.lane.category;
        let generation = pending.generation;
        let inner = self.inner.clone();
        let handle = tokio::task::spawn_blocking(move || compute(&inner, pending));
        CaptureTicket {
            category,
            generation,
            handle,
        }
    }
}

fn compute(inner: &Inner, pending: PendingCapture) -> CaptureOutcome {
    let PendingCapture {
        lane,
        generation,
        token,
        snapshot,
    } = pending;

    let payload = match snapshot {
        LocalSnapshot::Redirects {
            files,
            swaps,
            meta,
            permissions,
        } => match collect_redirects(inner, &files, permissions, &token) {
            Some(files) => AggregatePayload::Redirects(RedirectSet { files, swaps, meta }),
            None => {
                tracing::debug!(category = %lane.category, generation, "capture cancelled");
                return CaptureOutcome::Stale;
            }
        },
        LocalSnapshot::State(payload) => payload,
    };

    if !payload.fits(lane.category) {
        tracing::warn!(category = %lane.category, "snapshot payload does not fit its category");
        return CaptureOutcome::Failed;
    }

    publish(inner, &lane, generation, &token, payload)
}

/// Store every admitted file and merge game paths per `(hash, extension)`.
/// `None` once `token` is cancelled.
fn collect_redirects(
    inner: &Inner,
    files: &[CandidateFile],
    permissions: Permissions,
    token: &CancellationToken,
) -> Option<Vec<ContentRedirect>> {
    let permissions = permissions.restricted_to(inner.config.permissions);
    let mut merged: BTreeMap<(ContentHash, String), BTreeSet<String>> = BTreeMap::new();
    for file in files {
        if token.is_cancelled() {
            return None;
        }
        if !inner.config.extensions.admits(&file.extension, permissions) {
            tracing::debug!(
                path = %file.source.display(),
                extension = %file.extension,
                "extension not admitted"
            );
            continue;
        }
        let stored = match inner.store.put_file(&file.source) {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!(path = %file.source.display(), error = %err, "excluding file from capture");
                continue;
            }
        };
        merged
            .entry((stored.hash, normalize_extension(&file.extension)))
            .or_default()
            .extend(file.game_paths.iter().cloned());
    }
    Some(
        merged
            .into_iter()
            .map(|((hash, extension), paths)| ContentRedirect::new(hash, &extension, paths))
            .filter(|redirect| !redirect.game_paths.is_empty())
            .collect(),
    )
}

fn publish(
    inner: &Inner,
    lane: &Lane,
    generation: u64,
    token: &CancellationToken,
    payload: AggregatePayload,
) -> CaptureOutcome {
    let key = aggregate_key(&payload);
    let category = lane.category;

    let mut state = lane.lock();
    if state.generation != generation || token.is_cancelled() {
        tracing::debug!(%category, generation, current = state.generation, "discarding stale capture");
        return CaptureOutcome::Stale;
    }
    if state.last_key.as_ref() == Some(&key) {
        tracing::debug!(%category, "aggregate unchanged, skipping publish");
        return CaptureOutcome::Unchanged;
    }

    let version = state.last_published.as_ref().map_or(1, |doc| doc.version + 1);
    let doc = Arc::new(AggregateDocument {
        version,
        category,
        published_at: Utc::now(),
        payload,
    });
    let previous = state.last_published.replace(doc.clone());
    let previous_key = state.last_key.replace(key);

    match document::save_at(&inner.data_root, &doc) {
        Ok(path) => {
            tracing::info!(%category, version, path = %path.display(), "published aggregate");
            CaptureOutcome::Published { version }
        }
        Err(err) => {
            state.last_published = previous;
            state.last_key = previous_key;
            tracing::error!(%category, error = %err, "failed to persist aggregate");
            CaptureOutcome::Failed
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
