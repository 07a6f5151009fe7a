//! Reconciliation & application engine for remote stars.
//!
//! Per (peer, category) the engine walks `NoState -> Cached -> Applied`.
//! A pass:
//!
//! 1. reads the peer's documents on the blocking pool and caches any whose
//!    aggregate key changed,
//! 2. locates the live target on the authoritative thread (absent: stop,
//!    everything stays cached),
//! 3. for each category whose cached key differs from the applied one (or
//!    whose target changed, or which still has gated paths), rebuilds the
//!    path map through the safety gate and pushes it to the host surface.
//!
//! The engine is the single writer of its state; every method takes
//! `&mut self`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

use starpack_core::{
    document, AggregateDocument, AggregateKey, Category, PackId, PackRoots,
    PathResolver, PeerId, PipelineConfig, RedirectSet,
};
use starpack_store::{aggregate_key, redirect_delta, ContentStore, SafetyGate, StoreError};

use crate::authority::Authority;
use crate::error::{join_err, DaemonError};
use crate::paths::mapping_name;
use crate::surface::{
    LiveTargets, ModSurface, OverlayId, PathMap, StateSurface, SurfaceError, TargetId,
};

/// Where a (peer, category) pair stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NoState,
    /// Observed but not (yet) applied to a live target.
    Cached,
    Applied,
}

/// Application state of one category of one remote star.
#[derive(Debug, Clone, Default)]
pub struct ApplicationState {
    pub cached: Option<Arc<AggregateDocument>>,
    pub cached_key: Option<AggregateKey>,
    pub last_applied: Option<AggregateKey>,
    /// Fingerprint of the path map and meta last pushed to the surface.
    pub applied_fingerprint: Option<AggregateKey>,
    /// Game paths left out of the last applied map (unverified content or
    /// content not synced yet).
    pub gated: usize,
    pub assigned_overlay: Option<OverlayId>,
    pub assigned_target: Option<TargetId>,
    pub assigned_profile: Option<String>,
}

impl ApplicationState {
    pub fn phase(&self) -> Phase {
        match (&self.cached_key, &self.last_applied) {
            (None, _) => Phase::NoState,
            (Some(cached), Some(applied)) if cached == applied => Phase::Applied,
            _ => Phase::Cached,
        }
    }

    fn is_current(&self, target: TargetId) -> bool {
        self.cached_key.is_some()
            && self.last_applied == self.cached_key
            && self.assigned_target == Some(target)
    }
}

/// Summary of one reconciliation pass over one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub peer: PeerId,
    /// Skipped because the previous pass was too recent.
    pub throttled: bool,
    pub target: Option<TargetId>,
    pub phases: BTreeMap<Category, Phase>,
    pub applied: Vec<Category>,
    pub failed: Vec<Category>,
    /// Game paths still waiting on a verdict or on content.
    pub pending: usize,
}

impl PassReport {
    fn new(peer: &PeerId) -> Self {
        Self {
            peer: peer.clone(),
            throttled: false,
            target: None,
            phases: BTreeMap::new(),
            applied: Vec::new(),
            failed: Vec::new(),
            pending: 0,
        }
    }
}

/// Host capabilities the engine drives.
#[derive(Clone)]
pub struct HostSurfaces {
    pub mods: Arc<dyn ModSurface>,
    pub states: Arc<dyn StateSurface>,
    pub targets: Arc<dyn LiveTargets>,
}

struct PeerEntry {
    pack: PackId,
    overlay: Option<OverlayId>,
    last_pass: Option<Instant>,
    categories: BTreeMap<Category, ApplicationState>,
}

impl PeerEntry {
    fn new(pack: PackId) -> Self {
        Self {
            pack,
            overlay: None,
            last_pass: None,
            categories: BTreeMap::new(),
        }
    }
}

struct Context {
    authority: Authority,
    resolver: Arc<dyn PathResolver>,
    gate: Arc<SafetyGate>,
    surfaces: HostSurfaces,
    config: PipelineConfig,
}

/// Converges live targets of paired remote stars to their published
/// aggregates.
pub struct ReconcileEngine {
    ctx: Context,
    peers: BTreeMap<PeerId, PeerEntry>,
}

impl ReconcileEngine {
    pub fn new(
        authority: Authority,
        resolver: Arc<dyn PathResolver>,
        gate: Arc<SafetyGate>,
        surfaces: HostSurfaces,
        config: PipelineConfig,
    ) -> Self {
        Self {
            ctx: Context {
                authority,
                resolver,
                gate,
                surfaces,
                config,
            },
            peers: BTreeMap::new(),
        }
    }

    /// Start tracking `peer`, whose aggregates live in `pack`. Re-pairing
    /// with a different pack drops the cached state.
    pub fn pair(&mut self, peer: PeerId, pack: PackId) {
        match self.peers.get_mut(&peer) {
            Some(entry) if entry.pack == pack => {}
            Some(entry) => {
                tracing::info!(%peer, %pack, "peer moved to another pack");
                entry.pack = pack;
                entry.categories.clear();
                entry.last_pass = None;
            }
            None => {
                tracing::info!(%peer, %pack, "paired peer");
                self.peers.insert(peer, PeerEntry::new(pack));
            }
        }
    }

    /// Forget `peer`, removing what was applied to its live target on a
    /// best-effort basis. Returns whether the peer was paired.
    pub async fn unpair(&mut self, peer: &PeerId) -> Result<bool, DaemonError> {
        let Some(entry) = self.peers.remove(peer) else {
            return Ok(false);
        };
        tracing::info!(%peer, "unpaired peer");

        let applied: Vec<(Category, Option<OverlayId>)> = entry
            .categories
            .iter()
            .filter(|(_, state)| state.last_applied.is_some())
            .map(|(category, state)| (*category, state.assigned_overlay.clone()))
            .collect();
        if applied.is_empty() {
            return Ok(true);
        }

        let surfaces = self.ctx.surfaces.clone();
        let owner = peer.clone();
        let failures = self
            .ctx
            .authority
            .run(move || {
                let target = surfaces.targets.locate(&owner);
                let mut failures = Vec::new();
                for (category, overlay) in applied {
                    let result = match (category, overlay, target) {
                        (Category::Redirects, Some(overlay), _) => surfaces
                            .mods
                            .remove_mapping(&mapping_name(category), &overlay)
                            .and_then(|_| target.map_or(Ok(()), |t| surfaces.mods.refresh(t))),
                        (Category::Redirects, None, _) | (_, _, None) => Ok(()),
                        (_, _, Some(target)) => surfaces.states.revert_state(target, category),
                    };
                    if let Err(err) = result {
                        failures.push((category, err));
                    }
                }
                failures
            })
            .await?;
        for (category, err) in failures {
            tracing::warn!(%peer, %category, error = %err, "cleanup after unpair failed");
        }
        Ok(true)
    }

    pub fn is_paired(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = (&PeerId, &PackId)> {
        self.peers.iter().map(|(peer, entry)| (peer, &entry.pack))
    }

    pub fn state(&self, peer: &PeerId, category: Category) -> Option<&ApplicationState> {
        self.peers.get(peer)?.categories.get(&category)
    }

    pub fn overlay(&self, peer: &PeerId) -> Option<&OverlayId> {
        self.peers.get(peer)?.overlay.as_ref()
    }

    /// Run one pass over `peer`.
    pub async fn reconcile(&mut self, peer: &PeerId) -> Result<PassReport, DaemonError> {
        let entry = self
            .peers
            .get_mut(peer)
            .ok_or_else(|| DaemonError::UnknownPeer(peer.clone()))?;
        reconcile_peer(&self.ctx, peer, entry).await
    }

    /// Run one pass over every paired peer. A failing peer never stops the
    /// others.
    pub async fn reconcile_all(&mut self) -> Vec<PassReport> {
        let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
        let mut reports = Vec::with_capacity(peers.len());
        for peer in peers {
            match self.reconcile(&peer).await {
                Ok(report) => reports.push(report),
                Err(err) => tracing::error!(%peer, error = %err, "reconciliation pass failed"),
            }
        }
        reports
    }
}

async fn reconcile_peer(
    ctx: &Context,
    peer: &PeerId,
    entry: &mut PeerEntry,
) -> Result<PassReport, DaemonError> {
    let mut report = PassReport::new(peer);
    let now = Instant::now();
    if let Some(last) = entry.last_pass {
        if now.duration_since(last) < ctx.config.min_reconcile_interval() {
            report.throttled = true;
            report.phases = phases(entry);
            return Ok(report);
        }
    }
    entry.last_pass = Some(now);

    let Some(roots) = ctx.resolver.resolve(&entry.pack) else {
        tracing::debug!(%peer, pack = %entry.pack, "pack not available yet");
        report.phases = phases(entry);
        return Ok(report);
    };

    let data_root = roots.data.clone();
    let observed = tokio::task::spawn_blocking(move || load_documents(&data_root))
        .await
        .map_err(|e| join_err("document load", e))?;
    for (doc, key) in observed {
        let state = entry.categories.entry(doc.category).or_default();
        if state.cached_key.as_ref() != Some(&key) {
            tracing::debug!(%peer, category = %doc.category, version = doc.version, "cached new aggregate");
            if let (Some(old), Some(new)) = (
                state.cached.as_ref().and_then(|d| d.payload.as_redirects()),
                doc.payload.as_redirects(),
            ) {
                tracing::info!(%peer, delta = %redirect_delta(old, new), "redirect aggregate changed");
            }
            state.cached = Some(Arc::new(doc));
            state.cached_key = Some(key);
        }
    }

    let targets = ctx.surfaces.targets.clone();
    let owner = peer.clone();
    let target = ctx.authority.run(move || targets.locate(&owner)).await?;
    report.target = target;
    let Some(target) = target else {
        tracing::debug!(%peer, "no live target, keeping aggregates cached");
        report.phases = phases(entry);
        return Ok(report);
    };

    let categories: Vec<Category> = entry.categories.keys().copied().collect();
    for category in categories {
        let outcome = match category {
            Category::Redirects => apply_redirects(ctx, peer, entry, &roots, target).await?,
            _ => apply_state(ctx, peer, entry, category, target).await?,
        };
        match outcome {
            Applied::Skipped => {}
            Applied::Done => report.applied.push(category),
            Applied::Failed => report.failed.push(category),
        }
    }

    report.pending = entry.categories.values().map(|s| s.gated).sum();
    report.phases = phases(entry);
    Ok(report)
}

enum Applied {
    Skipped,
    Done,
    Failed,
}

async fn apply_redirects(
    ctx: &Context,
    peer: &PeerId,
    entry: &mut PeerEntry,
    roots: &PackRoots,
    target: TargetId,
) -> Result<Applied, DaemonError> {
    let Some(state) = entry.categories.get(&Category::Redirects) else {
        return Ok(Applied::Skipped);
    };
    if state.is_current(target) && state.gated == 0 {
        return Ok(Applied::Skipped);
    }
    let Some(doc) = state.cached.clone() else {
        return Ok(Applied::Skipped);
    };
    let current = state.is_current(target);
    let previous_fingerprint = state.applied_fingerprint.clone();

    let gate = ctx.gate.clone();
    let store = ContentStore::new(&roots.files);
    let pack = entry.pack.clone();
    let scanning = ctx.config.scanning_enabled;
    let built = tokio::task::spawn_blocking(move || {
        let empty = RedirectSet::default();
        let set = doc.payload.as_redirects().unwrap_or(&empty);
        build_path_map(&gate, &store, &pack, set, scanning)
    })
    .await
    .map_err(|e| join_err("path map", e))?;

    if current && previous_fingerprint.as_ref() == Some(&built.fingerprint) {
        if let Some(state) = entry.categories.get_mut(&Category::Redirects) {
            state.gated = built.pending;
        }
        return Ok(Applied::Skipped);
    }

    let mods = ctx.surfaces.mods.clone();
    let owner = peer.clone();
    let existing = entry.overlay.clone();
    let name = mapping_name(Category::Redirects);
    let paths = built.paths;
    let meta = built.meta;
    let (overlay, result) = ctx
        .authority
        .run(move || {
            let overlay = match existing {
                Some(overlay) => overlay,
                None => match mods.create_overlay(&owner) {
                    Ok(overlay) => overlay,
                    Err(err) => return (None, Err(err)),
                },
            };
            let result = push_mapping(mods.as_ref(), &name, &overlay, &paths, &meta, target);
            (Some(overlay), result)
        })
        .await?;

    if entry.overlay.is_none() {
        entry.overlay = overlay.clone();
    }
    let Some(state) = entry.categories.get_mut(&Category::Redirects) else {
        return Ok(Applied::Skipped);
    };
    match result {
        Ok(()) => {
            tracing::info!(
                %peer,
                %target,
                pending = built.pending,
                "applied redirect aggregate"
            );
            state.last_applied = state.cached_key.clone();
            state.applied_fingerprint = Some(built.fingerprint);
            state.gated = built.pending;
            state.assigned_overlay = overlay;
            state.assigned_target = Some(target);
            Ok(Applied::Done)
        }
        Err(err) => {
            tracing::error!(%peer, %target, error = %err, "failed to apply redirect aggregate");
            Ok(Applied::Failed)
        }
    }
}

async fn apply_state(
    ctx: &Context,
    peer: &PeerId,
    entry: &mut PeerEntry,
    category: Category,
    target: TargetId,
) -> Result<Applied, DaemonError> {
    let Some(state) = entry.categories.get(&category) else {
        return Ok(Applied::Skipped);
    };
    if state.is_current(target) {
        return Ok(Applied::Skipped);
    }
    let Some(doc) = state.cached.clone() else {
        return Ok(Applied::Skipped);
    };

    let states = ctx.surfaces.states.clone();
    let result = ctx
        .authority
        .run(move || states.apply_state(target, category, &doc.payload))
        .await?;

    let Some(state) = entry.categories.get_mut(&category) else {
        return Ok(Applied::Skipped);
    };
    match result {
        Ok(profile) => {
            tracing::info!(%peer, %category, %target, "applied state aggregate");
            state.last_applied = state.cached_key.clone();
            state.assigned_target = Some(target);
            if profile.is_some() {
                state.assigned_profile = profile;
            }
            Ok(Applied::Done)
        }
        Err(err) => {
            tracing::error!(%peer, %category, error = %err, "failed to apply state aggregate");
            Ok(Applied::Failed)
        }
    }
}

fn push_mapping(
    mods: &dyn ModSurface,
    name: &str,
    overlay: &OverlayId,
    paths: &PathMap,
    meta: &str,
    target: TargetId,
) -> Result<(), SurfaceError> {
    mods.remove_mapping(name, overlay)?;
    mods.add_mapping(name, overlay, paths, meta)?;
    mods.assign_overlay(overlay, target)?;
    mods.refresh(target)
}

fn phases(entry: &PeerEntry) -> BTreeMap<Category, Phase> {
    entry
        .categories
        .iter()
        .map(|(category, state)| (*category, state.phase()))
        .collect()
}

/// Every readable document under `data_root`, canonicalized, with its
/// aggregate key.
fn load_documents(data_root: &Path) -> Vec<(AggregateDocument, AggregateKey)> {
    let categories = match document::list_categories_at(data_root) {
        Ok(categories) => categories,
        Err(err) => {
            tracing::warn!(path = %data_root.display(), error = %err, "cannot list remote documents");
            return Vec::new();
        }
    };
    categories
        .into_iter()
        .filter_map(|category| match document::load_at(data_root, category) {
            Ok(mut doc) if doc.category == category && doc.payload.fits(category) => {
                doc.payload = doc.payload.canonicalized();
                let key = aggregate_key(&doc.payload);
                Some((doc, key))
            }
            Ok(_) => {
                tracing::warn!(%category, "remote document does not match its file name");
                None
            }
            Err(err) => {
                tracing::warn!(%category, error = %err, "skipping unreadable remote document");
                None
            }
        })
        .collect()
}

struct BuiltMap {
    paths: PathMap,
    meta: String,
    pending: usize,
    fingerprint: AggregateKey,
}

/// Path map for `set`: each game path whose content is stored and
/// activatable maps to the store file; swaps map unconditionally.
fn build_path_map(
    gate: &SafetyGate,
    store: &ContentStore,
    pack: &PackId,
    set: &RedirectSet,
    scanning_enabled: bool,
) -> BuiltMap {
    let mut paths = PathMap::new();
    let mut pending = 0;
    for redirect in &set.files {
        let stored: PathBuf = match store.resolve(&redirect.hash) {
            Ok(path) => path,
            Err(StoreError::NotFound { .. }) => {
                tracing::debug!(hash = %redirect.hash, "content not synced yet");
                pending += redirect.game_paths.len();
                continue;
            }
            Err(err) => {
                tracing::warn!(hash = %redirect.hash, error = %err, "cannot resolve content");
                pending += redirect.game_paths.len();
                continue;
            }
        };
        if !gate.is_activatable(&stored, pack, scanning_enabled) {
            pending += redirect.game_paths.len();
            continue;
        }
        let replacement = stored.to_string_lossy().into_owned();
        for game_path in &redirect.game_paths {
            paths.insert(game_path.clone(), replacement.clone());
        }
    }
    for swap in &set.swaps {
        paths
            .entry(swap.source.clone())
            .or_insert_with(|| swap.target.clone());
    }
    let fingerprint = map_fingerprint(&paths, &set.meta);
    BuiltMap {
        paths,
        meta: set.meta.clone(),
        pending,
        fingerprint,
    }
}

fn map_fingerprint(paths: &PathMap, meta: &str) -> AggregateKey {
    let mut hasher = Sha256::new();
    for (game_path, replacement) in paths {
        hasher.update(game_path.as_bytes());
        hasher.update([0u8]);
        hasher.update(replacement.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(meta.as_bytes());
    AggregateKey(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
