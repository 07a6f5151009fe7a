use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use filetime::{set_file_mtime, FileTime};
use tempfile::TempDir;

use starpack_core::{
    document, AggregateDocument, AggregatePayload, Category, ContentHash, ContentRedirect,
    DirectoryResolver, PackId, PackRoots, PathResolver, PathSwap, PeerId, PipelineConfig,
    RedirectSet, ScanRecord, ScanVerdict, StateBlob,
};
use starpack_daemon::{
    Authority, HostSurfaces, LiveTargets, ModSurface, OverlayId, PathMap, Phase, ReconcileEngine,
    StateSurface, SurfaceError, TargetId,
};
use starpack_store::{AlertSink, ContentStore, SafetyAlert, SafetyGate, Scanner};

// ─── Fakes ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Create(PeerId),
    Remove(String),
    Add { paths: PathMap, meta: String },
    Assign(OverlayId, TargetId),
    Refresh(TargetId),
}

#[derive(Default)]
struct RecordingMods {
    calls: Mutex<Vec<Call>>,
    fail_add: AtomicBool,
}

impl RecordingMods {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn adds(&self) -> Vec<(PathMap, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Add { paths, meta } => Some((paths, meta)),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }
}

impl ModSurface for RecordingMods {
    fn create_overlay(&self, owner: &PeerId) -> Result<OverlayId, SurfaceError> {
        self.calls.lock().unwrap().push(Call::Create(owner.clone()));
        Ok(OverlayId(format!("overlay-{owner}")))
    }

    fn remove_mapping(&self, name: &str, _overlay: &OverlayId) -> Result<(), SurfaceError> {
        self.calls.lock().unwrap().push(Call::Remove(name.to_string()));
        Ok(())
    }

    fn add_mapping(
        &self,
        _name: &str,
        _overlay: &OverlayId,
        paths: &PathMap,
        meta: &str,
    ) -> Result<(), SurfaceError> {
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(SurfaceError::new("surface unavailable"));
        }
        self.calls.lock().unwrap().push(Call::Add {
            paths: paths.clone(),
            meta: meta.to_string(),
        });
        Ok(())
    }

    fn assign_overlay(&self, overlay: &OverlayId, target: TargetId) -> Result<(), SurfaceError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Assign(overlay.clone(), target));
        Ok(())
    }

    fn refresh(&self, target: TargetId) -> Result<(), SurfaceError> {
        self.calls.lock().unwrap().push(Call::Refresh(target));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingStates {
    applied: Mutex<Vec<(TargetId, Category)>>,
    reverted: Mutex<Vec<Category>>,
}

impl StateSurface for RecordingStates {
    fn apply_state(
        &self,
        target: TargetId,
        category: Category,
        _payload: &AggregatePayload,
    ) -> Result<Option<String>, SurfaceError> {
        self.applied.lock().unwrap().push((target, category));
        Ok(matches!(category, Category::Appearance(_)).then(|| "profile-7".to_string()))
    }

    fn revert_state(&self, _target: TargetId, category: Category) -> Result<(), SurfaceError> {
        self.reverted.lock().unwrap().push(category);
        Ok(())
    }
}

#[derive(Default)]
struct Targets(Mutex<HashMap<PeerId, TargetId>>);

impl Targets {
    fn show(&self, peer: &PeerId, target: TargetId) {
        self.0.lock().unwrap().insert(peer.clone(), target);
    }
}

impl LiveTargets for Targets {
    fn locate(&self, peer: &PeerId) -> Option<TargetId> {
        self.0.lock().unwrap().get(peer).copied()
    }
}

#[derive(Default)]
struct Scans(Mutex<Vec<PathBuf>>);

impl Scanner for Scans {
    fn enqueue(&self, path: &std::path::Path) {
        self.0.lock().unwrap().push(path.to_path_buf());
    }
}

#[derive(Default)]
struct Alerts(Mutex<Vec<SafetyAlert>>);

impl AlertSink for Alerts {
    fn alert(&self, alert: &SafetyAlert) {
        self.0.lock().unwrap().push(alert.clone());
    }
}

// ─── Fixture ───────────────────────────────────────────────────────────────────

struct World {
    _tmp: TempDir,
    roots: PackRoots,
    peer: PeerId,
    store: ContentStore,
    mods: Arc<RecordingMods>,
    states: Arc<RecordingStates>,
    targets: Arc<Targets>,
    alerts: Arc<Alerts>,
    gate: Arc<SafetyGate>,
    engine: ReconcileEngine,
}

fn world(scanning_enabled: bool) -> World {
    let tmp = TempDir::new().expect("tmp");
    let resolver = DirectoryResolver::new(tmp.path());
    let pack = PackId::from("pack-b");
    std::fs::create_dir_all(resolver.pack_dir(&pack)).expect("pack dir");
    let roots = resolver.resolve(&pack).expect("resolvable pack");

    let mods = Arc::new(RecordingMods::default());
    let states = Arc::new(RecordingStates::default());
    let targets = Arc::new(Targets::default());
    let alerts = Arc::new(Alerts::default());
    let gate = Arc::new(SafetyGate::new(Arc::new(Scans::default()), alerts.clone()));
    let (authority, _thread) = Authority::spawn_thread("reconcile-authority").expect("authority");

    let config = PipelineConfig {
        scanning_enabled,
        ..PipelineConfig::unthrottled()
    };
    let mut engine = ReconcileEngine::new(
        authority,
        Arc::new(resolver),
        gate.clone(),
        HostSurfaces {
            mods: mods.clone(),
            states: states.clone(),
            targets: targets.clone(),
        },
        config,
    );
    let peer = PeerId::from("star-b");
    engine.pair(peer.clone(), pack);

    World {
        store: ContentStore::new(&roots.files),
        _tmp: tmp,
        roots,
        peer,
        mods,
        states,
        targets,
        alerts,
        gate,
        engine,
    }
}

impl World {
    /// Store `bytes` with an mtime an hour in the past.
    fn put(&self, bytes: &[u8]) -> ContentHash {
        let stored = self.store.put(bytes).expect("put");
        let old = Utc::now() - ChronoDuration::hours(1);
        set_file_mtime(&stored.path, FileTime::from_system_time(old.into())).expect("mtime");
        stored.hash
    }

    fn publish(&self, version: u64, payload: AggregatePayload) {
        let category = match &payload {
            AggregatePayload::Redirects(_) => Category::Redirects,
            AggregatePayload::Appearance(_) => Category::Appearance(1),
            AggregatePayload::Pose(_) => Category::Pose,
            AggregatePayload::Basic(_) => Category::Basic,
        };
        document::save_at(
            &self.roots.data,
            &AggregateDocument {
                version,
                category,
                published_at: Utc::now(),
                payload,
            },
        )
        .expect("save document");
    }

    fn record(&self, hash: &ContentHash, verdict: ScanVerdict) {
        self.gate.record(ScanRecord {
            path: self.store.path_for(hash),
            verdict,
            malware_id: (verdict == ScanVerdict::Infected).then(|| "Trojan.Test".to_string()),
            scan_time: Utc::now(),
        });
    }
}

fn outfit(files: Vec<ContentRedirect>, meta: &str) -> AggregatePayload {
    AggregatePayload::Redirects(RedirectSet {
        files,
        swaps: vec![PathSwap::new("chara/x.mdl", "chara/y.mdl")],
        meta: meta.to_string(),
    })
}

// ─── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn meta_only_change_reregisters_mapping_and_reassigns_overlay() {
    let mut w = world(false);
    let hash = w.put(b"texture");
    w.targets.show(&w.peer, TargetId(7));
    let files = vec![ContentRedirect::new(hash, ".tex", ["chara/a.tex"])];

    w.publish(1, outfit(files.clone(), "meta-1"));
    let first = w.engine.reconcile(&w.peer).await.expect("first pass");
    assert_eq!(first.applied, vec![Category::Redirects]);

    w.publish(2, outfit(files, "meta-2"));
    let second = w.engine.reconcile(&w.peer).await.expect("second pass");
    assert_eq!(second.applied, vec![Category::Redirects]);

    let adds = w.mods.adds();
    assert_eq!(adds.len(), 2);
    assert_eq!(adds[0].0, adds[1].0, "path map is rebuilt unchanged");
    assert_eq!(adds[1].1, "meta-2");
    assert_eq!(adds[1].0.get("chara/x.mdl").map(String::as_str), Some("chara/y.mdl"));
    assert_eq!(w.mods.count(|c| matches!(c, Call::Create(_))), 1, "overlay is created once");
    assert_eq!(w.mods.count(|c| matches!(c, Call::Assign(..))), 2);
    assert_eq!(w.mods.count(|c| matches!(c, Call::Refresh(_))), 2);
}

#[tokio::test]
async fn infected_content_is_withheld_until_rescanned_clean() {
    let mut w = world(true);
    let hash = w.put(b"suspicious");
    let safe = w.put(b"fine");
    w.record(&hash, ScanVerdict::Infected);
    w.record(&safe, ScanVerdict::Clean);
    w.targets.show(&w.peer, TargetId(3));
    w.publish(
        1,
        outfit(
            vec![
                ContentRedirect::new(hash.clone(), ".tex", ["chara/bad.tex"]),
                ContentRedirect::new(safe, ".tex", ["chara/ok.tex"]),
            ],
            "",
        ),
    );

    let report = w.engine.reconcile(&w.peer).await.expect("pass");
    assert_eq!(report.pending, 1);
    let adds = w.mods.adds();
    assert!(!adds[0].0.contains_key("chara/bad.tex"));
    assert!(adds[0].0.contains_key("chara/ok.tex"));

    // Same verdict on the next pass: no new alert and nothing re-applied.
    w.engine.reconcile(&w.peer).await.expect("pass");
    assert_eq!(w.alerts.0.lock().unwrap().len(), 1);
    assert_eq!(w.mods.adds().len(), 1);

    w.record(&hash, ScanVerdict::Clean);
    let report = w.engine.reconcile(&w.peer).await.expect("pass");
    assert_eq!(report.pending, 0);
    assert_eq!(report.applied, vec![Category::Redirects]);
    let adds = w.mods.adds();
    assert_eq!(adds.len(), 2);
    assert_eq!(
        adds[1].0.get("chara/bad.tex"),
        Some(&w.store.path_for(&hash).to_string_lossy().into_owned())
    );
    assert_eq!(w.mods.count(|c| matches!(c, Call::Assign(..))), 2);
}

#[tokio::test]
async fn cached_aggregate_is_applied_once_target_appears() {
    let mut w = world(false);
    let hash = w.put(b"model");
    w.publish(1, outfit(vec![ContentRedirect::new(hash, ".mdl", ["chara/m.mdl"])], ""));

    let report = w.engine.reconcile(&w.peer).await.expect("pass");
    assert_eq!(report.target, None);
    assert_eq!(report.phases.get(&Category::Redirects), Some(&Phase::Cached));
    assert!(w.mods.calls().is_empty());

    w.targets.show(&w.peer, TargetId(11));
    let report = w.engine.reconcile(&w.peer).await.expect("pass");
    assert_eq!(report.phases.get(&Category::Redirects), Some(&Phase::Applied));

    for _ in 0..3 {
        let report = w.engine.reconcile(&w.peer).await.expect("pass");
        assert!(report.applied.is_empty());
    }
    assert_eq!(w.mods.adds().len(), 1);
}

#[tokio::test]
async fn newer_aggregate_replaces_cached_without_target() {
    let mut w = world(false);
    let hash = w.put(b"model");
    let files = vec![ContentRedirect::new(hash, ".mdl", ["chara/m.mdl"])];
    w.publish(1, outfit(files.clone(), "old"));
    w.engine.reconcile(&w.peer).await.expect("pass");
    w.publish(2, outfit(files, "new"));
    w.engine.reconcile(&w.peer).await.expect("pass");

    let state = w.engine.state(&w.peer, Category::Redirects).expect("state");
    assert_eq!(state.cached.as_ref().map(|d| d.version), Some(2));
    assert_eq!(state.last_applied, None);

    w.targets.show(&w.peer, TargetId(1));
    w.engine.reconcile(&w.peer).await.expect("pass");
    let adds = w.mods.adds();
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].1, "new");
}

#[tokio::test]
async fn apply_failure_does_not_advance_and_is_retried() {
    let mut w = world(false);
    let hash = w.put(b"texture");
    w.targets.show(&w.peer, TargetId(2));
    w.publish(1, outfit(vec![ContentRedirect::new(hash, ".tex", ["chara/a.tex"])], ""));

    w.mods.fail_add.store(true, Ordering::SeqCst);
    let report = w.engine.reconcile(&w.peer).await.expect("pass");
    assert_eq!(report.failed, vec![Category::Redirects]);
    assert_eq!(report.phases.get(&Category::Redirects), Some(&Phase::Cached));

    w.mods.fail_add.store(false, Ordering::SeqCst);
    let report = w.engine.reconcile(&w.peer).await.expect("pass");
    assert_eq!(report.applied, vec![Category::Redirects]);
    assert_eq!(
        w.mods.count(|c| matches!(c, Call::Create(_))),
        1,
        "overlay from the failed pass is reused"
    );
}

#[tokio::test]
async fn unsynced_content_stays_pending_until_it_arrives() {
    let mut w = world(false);
    let missing = ContentStore::hash_bytes(b"late bytes");
    w.targets.show(&w.peer, TargetId(5));
    w.publish(
        1,
        outfit(vec![ContentRedirect::new(missing.clone(), ".tex", ["chara/late.tex"])], ""),
    );

    let report = w.engine.reconcile(&w.peer).await.expect("pass");
    assert_eq!(report.pending, 1);
    assert!(!w.mods.adds()[0].0.contains_key("chara/late.tex"));

    w.put(b"late bytes");
    let report = w.engine.reconcile(&w.peer).await.expect("pass");
    assert_eq!(report.pending, 0);
    assert!(w.mods.adds()[1].0.contains_key("chara/late.tex"));
}

#[tokio::test]
async fn state_categories_apply_through_state_surface() {
    let mut w = world(false);
    w.targets.show(&w.peer, TargetId(9));
    w.publish(
        1,
        AggregatePayload::Appearance(StateBlob {
            data: "profile-blob".to_string(),
        }),
    );

    let report = w.engine.reconcile(&w.peer).await.expect("pass");
    assert_eq!(report.applied, vec![Category::Appearance(1)]);
    let state = w
        .engine
        .state(&w.peer, Category::Appearance(1))
        .expect("state");
    assert_eq!(state.assigned_profile.as_deref(), Some("profile-7"));
    assert_eq!(
        *w.states.applied.lock().unwrap(),
        vec![(TargetId(9), Category::Appearance(1))]
    );
    assert!(w.mods.calls().is_empty());
}

#[tokio::test]
async fn unpair_removes_mappings_and_forgets_state() {
    let mut w = world(false);
    let hash = w.put(b"texture");
    w.targets.show(&w.peer, TargetId(4));
    w.publish(1, outfit(vec![ContentRedirect::new(hash, ".tex", ["chara/a.tex"])], ""));
    w.publish(2, AggregatePayload::Pose(StateBlob { data: "pose".to_string() }));
    w.engine.reconcile(&w.peer).await.expect("pass");

    let removes_before = w.mods.count(|c| matches!(c, Call::Remove(_)));
    assert!(w.engine.unpair(&w.peer).await.expect("unpair"));
    assert_eq!(w.mods.count(|c| matches!(c, Call::Remove(_))), removes_before + 1);
    assert_eq!(*w.states.reverted.lock().unwrap(), vec![Category::Pose]);
    assert!(!w.engine.is_paired(&w.peer));
    assert!(w.engine.state(&w.peer, Category::Redirects).is_none());
    assert!(!w.engine.unpair(&w.peer).await.expect("second unpair"));
    assert!(w.engine.reconcile(&w.peer).await.is_err());
}

#[tokio::test]
async fn target_change_triggers_reapply() {
    let mut w = world(false);
    let hash = w.put(b"texture");
    w.targets.show(&w.peer, TargetId(1));
    w.publish(1, outfit(vec![ContentRedirect::new(hash, ".tex", ["chara/a.tex"])], ""));
    w.engine.reconcile(&w.peer).await.expect("pass");

    w.targets.show(&w.peer, TargetId(2));
    let report = w.engine.reconcile(&w.peer).await.expect("pass");
    assert_eq!(report.applied, vec![Category::Redirects]);
    assert!(w
        .mods
        .calls()
        .contains(&Call::Assign(OverlayId("overlay-star-b".to_string()), TargetId(2))));
}

#[tokio::test]
async fn peer_spellings_of_one_path_apply_as_one_canonical_entry() {
    let mut w = world(false);
    let hash = w.put(b"texture");
    w.targets.show(&w.peer, TargetId(6));
    // Written by a peer that never ran the normalising constructors.
    w.publish(
        1,
        AggregatePayload::Redirects(RedirectSet {
            files: vec![ContentRedirect {
                hash: hash.clone(),
                extension: "TEX".to_string(),
                game_paths: BTreeSet::from(["Chara\\A.TEX".to_string(), "chara/a.tex".to_string()]),
            }],
            swaps: vec![PathSwap {
                source: " Chara\\X.MDL".to_string(),
                target: "Chara\\Y.mdl".to_string(),
            }],
            meta: String::new(),
        }),
    );

    let report = w.engine.reconcile(&w.peer).await.expect("pass");
    assert_eq!(report.applied, vec![Category::Redirects]);
    let adds = w.mods.adds();
    let keys: Vec<&str> = adds[0].0.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["chara/a.tex", "chara/x.mdl"]);
    assert_eq!(adds[0].0["chara/x.mdl"], "chara/y.mdl");
    assert_eq!(adds[0].0["chara/a.tex"], w.store.path_for(&hash).to_string_lossy());

    let cached = w
        .engine
        .state(&w.peer, Category::Redirects)
        .and_then(|s| s.cached.clone())
        .expect("cached");
    assert_eq!(cached.payload.as_redirects().expect("redirects").files[0].extension, ".tex");
}
