//! Filesystem watcher over the `Data` areas of paired remote packs.
//!
//! A document written by the transport triggers a reconciliation of the
//! peer owning the pack. Bursts of events for the same category document
//! of a peer collapse into one trigger per [`DEBOUNCE_WINDOW`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use starpack_core::{Category, PeerId};

use crate::error::DaemonError;
use crate::paths::DEBOUNCE_WINDOW;

/// Changes to the watched set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchCommand {
    /// Watch `data_root` on behalf of the peer.
    Add(PeerId, PathBuf),
    Remove(PeerId),
}

/// Run the watcher until shutdown. Sends the owning peer on `triggers` for
/// every debounced document change.
pub async fn watch_packs(
    mut commands: mpsc::UnboundedReceiver<WatchCommand>,
    triggers: mpsc::UnboundedSender<PeerId>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;

    let mut watched: HashMap<PathBuf, PeerId> = HashMap::new();
    let mut debounce = DocumentDebounce::new(DEBOUNCE_WINDOW);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                apply_command(&mut watcher, &mut watched, command);
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                for path in event.paths {
                    let Some(category) = document_category(&path) else { continue };
                    let Some(peer) = owner_of(&watched, &path) else { continue };
                    if !debounce.admit(peer, category, Instant::now()) {
                        continue;
                    }
                    tracing::debug!(%peer, %category, "remote document changed");
                    if triggers.send(peer.clone()).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
    Ok(())
}

fn apply_command(
    watcher: &mut RecommendedWatcher,
    watched: &mut HashMap<PathBuf, PeerId>,
    command: WatchCommand,
) {
    match command {
        WatchCommand::Add(peer, data_root) => {
            if let Err(err) = fs::create_dir_all(&data_root) {
                tracing::warn!(%peer, path = %data_root.display(), error = %err, "cannot create data dir to watch");
                return;
            }
            // Canonicalize so event paths (real paths on macOS) match.
            let data_root = fs::canonicalize(&data_root).unwrap_or(data_root);
            if watched.contains_key(&data_root) {
                watched.insert(data_root, peer);
                return;
            }
            match watcher.watch(&data_root, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    tracing::debug!(%peer, path = %data_root.display(), "watching pack data");
                    watched.insert(data_root, peer);
                }
                Err(err) => {
                    tracing::warn!(%peer, path = %data_root.display(), error = %err, "cannot watch pack data");
                }
            }
        }
        WatchCommand::Remove(peer) => {
            let roots: Vec<PathBuf> = watched
                .iter()
                .filter(|(_, owner)| **owner == peer)
                .map(|(root, _)| root.clone())
                .collect();
            for root in roots {
                watched.remove(&root);
                if let Err(err) = watcher.unwatch(&root) {
                    tracing::debug!(path = %root.display(), error = %err, "unwatch failed");
                }
            }
        }
    }
}

fn owner_of<'a>(watched: &'a HashMap<PathBuf, PeerId>, path: &Path) -> Option<&'a PeerId> {
    let parent = path.parent()?;
    watched
        .get(parent)
        .or_else(|| fs::canonicalize(parent).ok().and_then(|p| watched.get(&p)))
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

/// Category of a document file; `None` for temporaries and foreign files.
fn document_category(path: &Path) -> Option<Category> {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(Category::from_file_name)
}

/// Last trigger per (peer, category document). Entries are dropped as soon
/// as their window has passed, so the map only holds documents in a burst.
struct DocumentDebounce {
    window: Duration,
    last: HashMap<(PeerId, Category), Instant>,
}

impl DocumentDebounce {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    /// Whether a change to `category` of `peer` seen at `now` triggers.
    fn admit(&mut self, peer: &PeerId, category: Category, now: Instant) -> bool {
        let window = self.window;
        self.last.retain(|_, at| now.duration_since(*at) < window);
        match self.last.entry((peer.clone(), category)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }
}
