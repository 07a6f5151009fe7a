use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use filetime::{set_file_mtime, FileTime};
use tempfile::TempDir;
use tokio_test::assert_ok;

use starpack_core::{
    document, AggregatePayload, Category, DirectoryResolver, PackId, PeerId, Permissions,
    PipelineConfig, ScanRecord, ScanVerdict,
};
use starpack_daemon::{
    Authority, CandidateFile, CaptureOutcome, CaptureRequest, Host, HostSurfaces, LiveTargets,
    LocalSnapshot, LocalState, ModSurface, OverlayId, PathMap, Runtime, RuntimeOptions,
    StateSurface, SurfaceError, TargetId,
};
use starpack_store::{scan_store, AlertSink, ContentStore, SafetyAlert};

struct Outfit(Vec<CandidateFile>);

impl LocalState for Outfit {
    fn snapshot(&self, category: Category) -> Option<LocalSnapshot> {
        (category == Category::Redirects).then(|| LocalSnapshot::Redirects {
            files: self.0.clone(),
            swaps: vec![],
            meta: "meta".to_string(),
            permissions: Permissions::default(),
        })
    }
}

#[derive(Default)]
struct Mods(Mutex<Vec<PathMap>>);

impl ModSurface for Mods {
    fn create_overlay(&self, owner: &PeerId) -> Result<OverlayId, SurfaceError> {
        Ok(OverlayId(owner.to_string()))
    }
    fn remove_mapping(&self, _name: &str, _overlay: &OverlayId) -> Result<(), SurfaceError> {
        Ok(())
    }
    fn add_mapping(
        &self,
        _name: &str,
        _overlay: &OverlayId,
        paths: &PathMap,
        _meta: &str,
    ) -> Result<(), SurfaceError> {
        self.0.lock().unwrap().push(paths.clone());
        Ok(())
    }
    fn assign_overlay(&self, _overlay: &OverlayId, _target: TargetId) -> Result<(), SurfaceError> {
        Ok(())
    }
    fn refresh(&self, _target: TargetId) -> Result<(), SurfaceError> {
        Ok(())
    }
}

struct NoStates;

impl StateSurface for NoStates {
    fn apply_state(
        &self,
        _target: TargetId,
        _category: Category,
        _payload: &AggregatePayload,
    ) -> Result<Option<String>, SurfaceError> {
        Ok(None)
    }
    fn revert_state(&self, _target: TargetId, _category: Category) -> Result<(), SurfaceError> {
        Ok(())
    }
}

struct Everyone(HashMap<PeerId, TargetId>);

impl LiveTargets for Everyone {
    fn locate(&self, peer: &PeerId) -> Option<TargetId> {
        self.0.get(peer).copied()
    }
}

struct NoAlerts;

impl AlertSink for NoAlerts {
    fn alert(&self, _alert: &SafetyAlert) {}
}

struct Harness {
    tmp: TempDir,
    mods: Arc<Mods>,
    runtime: Runtime,
    link: starpack_daemon::ScannerLink,
    _authority: std::thread::JoinHandle<()>,
}

fn start(scanning_enabled: bool) -> Harness {
    let tmp = TempDir::new().expect("tmp");
    let packs = tmp.path().join("packs");
    std::fs::create_dir_all(packs.join("local")).expect("local pack");
    let source = tmp.path().join("mods/body.tex");
    std::fs::create_dir_all(source.parent().unwrap()).expect("mods dir");
    std::fs::write(&source, b"body texture").expect("source");

    let (authority, thread) = Authority::spawn_thread("runtime-authority").expect("authority");
    let mods = Arc::new(Mods::default());
    let host = Host {
        authority,
        local: Arc::new(Outfit(vec![CandidateFile::new(
            source,
            ["chara/body.tex"],
        )])),
        surfaces: HostSurfaces {
            mods: mods.clone(),
            states: Arc::new(NoStates),
            targets: Arc::new(Everyone(
                [(PeerId::from("echo"), TargetId(1))].into_iter().collect(),
            )),
        },
        resolver: Arc::new(DirectoryResolver::new(&packs)),
        alerts: Arc::new(NoAlerts),
    };
    let mut options = RuntimeOptions::new(tmp.path().join("state"), PackId::from("local"));
    options.config = Some(PipelineConfig {
        scanning_enabled,
        ..PipelineConfig::unthrottled()
    });
    options.reconcile_tick = Duration::from_secs(3600);

    let (runtime, link) = Runtime::start(options, host).expect("start");
    Harness {
        tmp,
        mods,
        runtime,
        link,
        _authority: thread,
    }
}

async fn wait_for<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(flavor = "multi_thread")]
async fn captured_outfit_flows_through_to_the_surface() {
    let h = start(false);
    let CaptureRequest::Scheduled(ticket) =
        assert_ok!(h.runtime.request_capture(Category::Redirects).await)
    else {
        panic!("capture not scheduled");
    };
    assert_eq!(
        assert_ok!(ticket.outcome().await),
        CaptureOutcome::Published { version: 1 }
    );
    let data = h.tmp.path().join("packs/local/Data");
    assert_eq!(
        assert_ok!(document::load_at(&data, Category::Redirects)).version,
        1
    );

    // Loop the local pack back in as a remote one.
    assert_ok!(h.runtime.pair(PeerId::from("echo"), PackId::from("local")).await);
    let report = assert_ok!(h.runtime.reconcile(PeerId::from("echo")).await);
    assert_eq!(report.applied, vec![Category::Redirects]);

    let stored = ContentStore::new(h.tmp.path().join("packs/local/Files"))
        .path_for(&ContentStore::hash_bytes(b"body texture"));
    let maps = h.mods.0.lock().unwrap().clone();
    assert_eq!(
        maps[0].get("chara/body.tex"),
        Some(&stored.to_string_lossy().into_owned())
    );

    assert_ok!(h.runtime.shutdown().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn clean_verdict_wakes_reconciliation_and_is_persisted() {
    let mut h = start(true);
    let CaptureRequest::Scheduled(ticket) =
        assert_ok!(h.runtime.request_capture(Category::Redirects).await)
    else {
        panic!("capture not scheduled");
    };
    assert_ok!(ticket.outcome().await);
    assert_ok!(h.runtime.pair(PeerId::from("echo"), PackId::from("local")).await);

    let report = assert_ok!(h.runtime.reconcile(PeerId::from("echo")).await);
    assert_eq!(report.pending, 1);

    let requested: PathBuf = h.link.requests.recv().await.expect("scan request");
    let old = Utc::now() - ChronoDuration::hours(1);
    set_file_mtime(&requested, FileTime::from_system_time(old.into())).expect("mtime");
    h.link
        .verdicts
        .send(ScanRecord {
            path: requested.clone(),
            verdict: ScanVerdict::Clean,
            malware_id: None,
            scan_time: Utc::now(),
        })
        .await
        .expect("deliver verdict");

    let mods = h.mods.clone();
    wait_for(move || {
        mods.0
            .lock()
            .unwrap()
            .last()
            .map_or(false, |map| map.contains_key("chara/body.tex"))
    })
    .await;

    assert_ok!(h.runtime.unpair(PeerId::from("echo")).await);
    assert_ok!(h.runtime.shutdown().await);
    let persisted = assert_ok!(scan_store::load_at(&h.tmp.path().join("state/scans")));
    assert_eq!(persisted.records.len(), 1);
}
