//! File watcher for automatic re-indexing.
//!
//! Raw notify events are filtered, debounced per path and merged, then
//! handed to the indexer in batches.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::indexer::Indexer;
use crate::paths::normalize_to_relative;

/// Most events folded into one reindex batch.
const MAX_BATCH: usize = 256;

/// Errors that can occur in the file watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to create watcher: {0}")]
    Create(#[source] notify::Error),

    #[error("Failed to watch {path:?}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("Initial index failed: {0}")]
    Index(#[from] crate::error::IndexError),
}

/// Events emitted by the file watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    /// Old path, new path
    Renamed(PathBuf, PathBuf),
}

/// Decides whether a root-relative path is worth reporting.
pub type PathFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
struct PendingEvent {
    event: FileEvent,
    last_seen: Instant,
}

/// File watcher that monitors a directory for changes.
pub struct FileWatcher {
    root: PathBuf,
    debounce: Duration,
    filter: PathFilter,
    // Dropping the watcher stops notifications
    watcher: Option<RecommendedWatcher>,
}

impl FileWatcher {
    pub fn new(root: PathBuf, debounce: Duration, filter: PathFilter) -> Self {
        Self {
            root,
            debounce,
            filter,
            watcher: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Start watching and return a channel of debounced events.
    pub fn start(&mut self) -> Result<mpsc::Receiver<FileEvent>, WatcherError> {
        let (raw_tx, raw_rx) = mpsc::channel::<FileEvent>(1024);
        let (debounced_tx, debounced_rx) = mpsc::channel(1024);
        let root = self.root.clone();
        let filter = self.filter.clone();
        let debounce = self.debounce;

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    for file_event in convert_event(event, &root, filter.as_ref()) {
                        // Best effort; a full channel only delays detection to the next run
                        let _ = raw_tx.blocking_send(file_event);
                    }
                }
                Err(e) => warn!("Watch error: {}", e),
            }
        })
        .map_err(WatcherError::Create)?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|source| WatcherError::Watch {
                path: self.root.clone(),
                source,
            })?;
        self.watcher = Some(watcher);

        tokio::spawn(debounce_events(raw_rx, debounced_tx, debounce));

        info!("Watching {:?} with {:?} debounce", self.root, debounce);
        Ok(debounced_rx)
    }

    pub fn stop(&mut self) {
        self.watcher = None;
        info!("Stopped watching {:?}", self.root);
    }
}

/// Hold each path until no new event arrived for `debounce`, merging events.
async fn debounce_events(
    mut raw_rx: mpsc::Receiver<FileEvent>,
    debounced_tx: mpsc::Sender<FileEvent>,
    debounce: Duration,
) {
    let mut pending: HashMap<PathBuf, PendingEvent> = HashMap::new();
    let tick = Duration::from_millis(50).min(debounce.max(Duration::from_millis(1)));

    loop {
        match tokio::time::timeout(tick, raw_rx.recv()).await {
            Ok(Some(event)) => {
                let path = event_path(&event).to_path_buf();
                let now = Instant::now();
                pending
                    .entry(path)
                    .and_modify(|p| {
                        p.event = merge_events(&p.event, &event);
                        p.last_seen = now;
                    })
                    .or_insert(PendingEvent {
                        event,
                        last_seen: now,
                    });
            }
            Ok(None) => {
                for (_, pending_event) in pending.drain() {
                    let _ = debounced_tx.send(pending_event.event).await;
                }
                break;
            }
            Err(_) => {}
        }

        let now = Instant::now();
        let mut ready = Vec::new();
        pending.retain(|_, p| {
            if now.duration_since(p.last_seen) >= debounce {
                ready.push(p.event.clone());
                false
            } else {
                true
            }
        });

        for event in ready {
            if debounced_tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

fn event_path(event: &FileEvent) -> &Path {
    match event {
        FileEvent::Created(p) | FileEvent::Modified(p) | FileEvent::Deleted(p) => p,
        FileEvent::Renamed(_, new) => new,
    }
}

/// Merge two events for the same path.
///
/// Deleted beats Created beats Modified; renames keep the latest target.
fn merge_events(existing: &FileEvent, new: &FileEvent) -> FileEvent {
    match (existing, new) {
        (_, FileEvent::Deleted(p)) => FileEvent::Deleted(p.clone()),
        (FileEvent::Deleted(p), _) => FileEvent::Deleted(p.clone()),

        (_, FileEvent::Renamed(old, new)) => FileEvent::Renamed(old.clone(), new.clone()),
        (FileEvent::Renamed(old, new), _) => FileEvent::Renamed(old.clone(), new.clone()),

        (FileEvent::Created(p), _) => FileEvent::Created(p.clone()),
        (FileEvent::Modified(_), FileEvent::Created(p)) => FileEvent::Created(p.clone()),
        (FileEvent::Modified(_), FileEvent::Modified(p)) => FileEvent::Modified(p.clone()),
    }
}

fn is_hidden(relative: &str) -> bool {
    relative.split('/').any(|s| s.starts_with('.') && s != "." && s != "..")
}

fn wanted(path: &Path, root: &Path, filter: &(dyn Fn(&str) -> bool + Send + Sync)) -> bool {
    let relative = normalize_to_relative(path, root);
    !relative.is_empty() && !is_hidden(&relative) && filter(&relative)
}

/// Convert a notify event into zero or more [`FileEvent`]s.
fn convert_event(
    event: Event,
    root: &Path,
    filter: &(dyn Fn(&str) -> bool + Send + Sync),
) -> Vec<FileEvent> {
    if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
        if let [from, to] = event.paths.as_slice() {
            return match (wanted(from, root, filter), wanted(to, root, filter)) {
                (true, true) => vec![FileEvent::Renamed(from.clone(), to.clone())],
                (true, false) => vec![FileEvent::Deleted(from.clone())],
                (false, true) => vec![FileEvent::Created(to.clone())],
                (false, false) => Vec::new(),
            };
        }
    }

    event
        .paths
        .into_iter()
        .filter(|path| wanted(path, root, filter))
        .filter_map(|path| match event.kind {
            EventKind::Create(_) => Some(FileEvent::Created(path)),
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(FileEvent::Deleted(path)),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(FileEvent::Created(path)),
            EventKind::Modify(_) => Some(FileEvent::Modified(path)),
            EventKind::Remove(_) => Some(FileEvent::Deleted(path)),
            _ => None,
        })
        .collect()
}

/// Paths to reindex for a batch of events; renames contribute both sides.
fn batch_paths(events: &[FileEvent]) -> Vec<PathBuf> {
    let mut paths = Vec::with_capacity(events.len());
    for event in events {
        match event {
            FileEvent::Created(p) | FileEvent::Modified(p) | FileEvent::Deleted(p) => {
                paths.push(p.clone())
            }
            FileEvent::Renamed(old, new) => {
                paths.push(old.clone());
                paths.push(new.clone());
            }
        }
    }
    paths
}

/// Background indexing service that watches for file changes.
pub struct IndexingService {
    watcher: FileWatcher,
    indexer: Arc<Indexer>,
}

impl IndexingService {
    pub fn new(indexer: Arc<Indexer>, debounce: Duration) -> Self {
        let accepting = indexer.clone();
        let filter: PathFilter = Arc::new(move |relative: &str| accepting.accepts(relative));
        let watcher = FileWatcher::new(indexer.root().to_path_buf(), debounce, filter);
        Self { watcher, indexer }
    }

    /// Catch up with one index cycle, then reindex on file events until the
    /// watcher channel closes.
    pub async fn run(mut self) -> Result<(), WatcherError> {
        let mut rx = self.watcher.start()?;
        let report = self.indexer.run().await?;
        info!(
            "Catch-up index: {} indexed, {} removed",
            report.outcome.indexed.len(),
            report.outcome.removed.len()
        );

        while let Some(event) = rx.recv().await {
            let mut events = vec![event];
            while events.len() < MAX_BATCH {
                match rx.try_recv() {
                    Ok(more) => events.push(more),
                    Err(_) => break,
                }
            }

            let paths = batch_paths(&events);
            debug!("Reindexing {} paths from {} events", paths.len(), events.len());
            match self.indexer.reindex_paths(paths.as_slice()).await {
                Ok(outcome) => {
                    for failure in &outcome.failed {
                        warn!("Could not reindex {}: {}", failure.path, failure.error);
                    }
                    info!(
                        "Reindexed {} files, refreshed {}, removed {}",
                        outcome.indexed.len(),
                        outcome.refreshed.len(),
                        outcome.removed.len()
                    );
                }
                Err(e) => error!("Reindex of {} paths failed: {}", paths.len(), e),
            }
        }

        self.watcher.stop();
        Ok(())
    }
}
