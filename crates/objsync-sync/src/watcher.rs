//! File watching and debounced change queue
//!
//! Provides a [`FileWatcher`] that wraps the `notify` crate to monitor the sync
//! root for changes, converting raw OS events into [`WatchEvent`] values. On
//! start it also scans the existing tree and reports every file as added,
//! followed by [`WatchEvent::Ready`].
//!
//! The [`DebouncedChangeQueue`] collects rapid-fire events and coalesces them
//! so that downstream consumers only see the final state of a path after it has
//! been quiet for the write-finish stability window.
//!
//! ## Architecture
//!
//! ```text
//! inotify / kqueue / initial scan
//!       │
//!       ▼
//!  FileWatcher  ──→  mpsc::channel  ──→  WatchPump ──→ DebouncedChangeQueue ──→ SyncManager
//!       ▲
//!   PauseGate (drops events while reconciliation runs)
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use objsync_core::domain::IgnoreRules;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use walkdir::WalkDir;

use crate::pause::PauseGate;

// ============================================================================
// WatchEvent enum
// ============================================================================

/// A local change reported by the watch source
///
/// Decoupled from the `notify` crate's raw event types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file appeared (created, moved in, or found by the initial scan)
    Added(PathBuf),
    /// An existing file's content changed
    Changed(PathBuf),
    /// A file was removed or moved away
    Removed(PathBuf),
    /// A directory appeared
    DirAdded(PathBuf),
    /// A directory was removed
    DirRemoved(PathBuf),
    /// The initial scan has finished
    Ready,
}

impl WatchEvent {
    /// Returns the path associated with this event, `None` for `Ready`
    pub fn path(&self) -> Option<&Path> {
        match self {
            WatchEvent::Added(p)
            | WatchEvent::Changed(p)
            | WatchEvent::Removed(p)
            | WatchEvent::DirAdded(p)
            | WatchEvent::DirRemoved(p) => Some(p),
            WatchEvent::Ready => None,
        }
    }

    /// Combine a pending event with a newer one for the same path
    ///
    /// - `Added` then `Changed` stays `Added`
    /// - anything then `Removed` becomes `Removed`
    /// - `Removed` then `Added` becomes `Changed`
    /// - otherwise the newer event wins
    pub fn merge(self, newer: WatchEvent) -> WatchEvent {
        match (self, newer) {
            (WatchEvent::Added(p), WatchEvent::Changed(_)) => WatchEvent::Added(p),
            (_, WatchEvent::Removed(p)) => WatchEvent::Removed(p),
            (WatchEvent::Removed(_), WatchEvent::Added(p)) => WatchEvent::Changed(p),
            (_, newer) => newer,
        }
    }
}

// ============================================================================
// FileWatcher struct
// ============================================================================

/// Watches the sync root for changes using the OS-native mechanism
///
/// On Linux this typically uses inotify. The watcher converts raw OS events
/// into [`WatchEvent`] values and sends them through an mpsc channel. Paths
/// matching the ignore rules (relative to the root) are dropped.
///
/// ## Usage
///
/// ```ignore
/// let (mut watcher, rx) = FileWatcher::new(root, IgnoreRules::default(), None)?;
/// let handle = watcher.watch()?;
/// // rx.recv().await to get events; WatchEvent::Ready follows the initial scan
/// drop(handle);
/// ```
pub struct FileWatcher {
    /// The underlying notify watcher instance
    watcher: RecommendedWatcher,
    /// Sender half of the channel used to emit WatchEvents
    event_tx: mpsc::Sender<WatchEvent>,
    root: PathBuf,
    ignore: IgnoreRules,
}

impl FileWatcher {
    /// Creates a new `FileWatcher` for `root`
    ///
    /// Returns the watcher and a receiver channel for consuming watch events.
    ///
    /// # Arguments
    /// * `root` - The sync root to watch
    /// * `ignore` - Component names to exclude
    /// * `gate` - Optional pause gate; live events are dropped while it is paused
    ///
    /// # Errors
    /// Returns an error if the underlying OS watcher cannot be created
    pub fn new(
        root: PathBuf,
        ignore: IgnoreRules,
        gate: Option<PauseGate>,
    ) -> Result<(Self, mpsc::Receiver<WatchEvent>)> {
        let (event_tx, event_rx) = mpsc::channel::<WatchEvent>(1024);
        let tx = event_tx.clone();

        info!(root = %root.display(), "Initializing file watcher");

        let cb_root = root.clone();
        let cb_ignore = ignore.clone();
        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if gate.as_ref().is_some_and(PauseGate::is_paused) {
                        trace!(kind = ?event.kind, "Watch paused, dropping event");
                        return;
                    }
                    for change in map_notify_event(&event) {
                        if is_ignored(&cb_root, &cb_ignore, &change) {
                            continue;
                        }
                        if let Err(e) = tx.blocking_send(change) {
                            warn!(error = %e, "Failed to send watch event (receiver dropped)");
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "File watcher error");
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        Ok((
            Self {
                watcher,
                event_tx,
                root,
                ignore,
            },
            event_rx,
        ))
    }

    /// Starts watching the root recursively and launches the initial scan
    ///
    /// The scan runs on a blocking thread, emits `Added` for every existing
    /// file that is not ignored, then `Ready`.
    ///
    /// # Errors
    /// Returns an error if the root cannot be watched (e.g., does not exist,
    /// insufficient permissions, or inotify watch limit reached)
    pub fn watch(&mut self) -> Result<WatchHandle> {
        info!(path = %self.root.display(), "Starting recursive watch");

        self.watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch path: {}", self.root.display()))?;

        let root = self.root.clone();
        let ignore = self.ignore.clone();
        let tx = self.event_tx.clone();
        tokio::task::spawn_blocking(move || initial_scan(&root, &ignore, &tx));

        Ok(WatchHandle {
            path: Some(self.root.clone()),
        })
    }

    /// Stops watching the root
    ///
    /// # Errors
    /// Returns an error if the root was not being watched
    pub fn unwatch(&mut self) -> Result<()> {
        info!(path = %self.root.display(), "Stopping watch");

        self.watcher
            .unwatch(&self.root)
            .with_context(|| format!("Failed to unwatch path: {}", self.root.display()))?;

        Ok(())
    }
}

fn is_ignored(root: &Path, ignore: &IgnoreRules, event: &WatchEvent) -> bool {
    match event.path() {
        Some(path) => {
            let relative = path.strip_prefix(root).unwrap_or(path);
            ignore.is_ignored_path(relative)
        }
        None => false,
    }
}

/// Walk the tree under `root`, emitting `Added` per file and finally `Ready`
fn initial_scan(root: &Path, ignore: &IgnoreRules, tx: &mpsc::Sender<WatchEvent>) {
    let mut count = 0usize;
    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            !ignore.is_ignored_path(relative)
        });

    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_file() => {
                count += 1;
                if tx
                    .blocking_send(WatchEvent::Added(entry.into_path()))
                    .is_err()
                {
                    warn!("Receiver dropped during initial scan");
                    return;
                }
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Skipping unreadable entry during initial scan"),
        }
    }

    info!(root = %root.display(), files = count, "Initial scan complete");
    let _ = tx.blocking_send(WatchEvent::Ready);
}

// ============================================================================
// WatchHandle - RAII guard for an active watch
// ============================================================================

/// Handle for an active filesystem watch
#[derive(Debug)]
pub struct WatchHandle {
    path: Option<PathBuf>,
}

impl WatchHandle {
    /// Returns the path being watched
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

// ============================================================================
// Event mapping - notify::Event → WatchEvent
// ============================================================================

/// Converts a `notify::Event` into zero or more `WatchEvent`s
///
/// Maps the notify event kinds as follows:
/// - `Create(Folder)` -> `DirAdded`, other `Create(*)` -> `Added`
///   (or `DirAdded` when the path is a directory)
/// - `Remove(Folder)` -> `DirRemoved`, other `Remove(*)` -> `Removed`
/// - `Modify(Name(Both))` with 2 paths -> `Removed(old)` + `Added(new)`
/// - `Modify(Name(From))` -> `Removed`, `Modify(Name(To))` -> `Added`
/// - Other `Modify(*)` on a file -> `Changed`
///
/// Access events and modifications of directories are ignored.
fn map_notify_event(event: &notify::Event) -> Vec<WatchEvent> {
    let paths = &event.paths;
    let Some(first) = paths.first() else {
        return Vec::new();
    };

    let mapped = match &event.kind {
        EventKind::Create(CreateKind::Folder) => vec![WatchEvent::DirAdded(first.clone())],
        EventKind::Create(_) => {
            if first.is_dir() {
                vec![WatchEvent::DirAdded(first.clone())]
            } else {
                vec![WatchEvent::Added(first.clone())]
            }
        }

        EventKind::Remove(RemoveKind::Folder) => vec![WatchEvent::DirRemoved(first.clone())],
        EventKind::Remove(_) => vec![WatchEvent::Removed(first.clone())],

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            let (old, new) = (paths[0].clone(), paths[1].clone());
            if new.is_dir() {
                vec![WatchEvent::DirRemoved(old), WatchEvent::DirAdded(new)]
            } else {
                vec![WatchEvent::Removed(old), WatchEvent::Added(new)]
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            vec![WatchEvent::Removed(first.clone())]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            if first.is_dir() {
                vec![WatchEvent::DirAdded(first.clone())]
            } else {
                vec![WatchEvent::Added(first.clone())]
            }
        }

        EventKind::Modify(_) => {
            if first.is_dir() {
                Vec::new()
            } else {
                vec![WatchEvent::Changed(first.clone())]
            }
        }

        _ => Vec::new(),
    };

    if mapped.is_empty() {
        trace!(kind = ?event.kind, "Ignoring event kind");
    } else {
        debug!(kind = ?event.kind, events = ?mapped, "Mapped notify event");
    }
    mapped
}

// ============================================================================
// DebouncedChangeQueue struct
// ============================================================================

/// Queue that coalesces rapid filesystem changes into settled events
///
/// When multiple events arrive for the same path in quick succession they
/// are merged (see [`WatchEvent::merge`]) and the path's timestamp is reset.
/// Events are only emitted (via [`poll`](DebouncedChangeQueue::poll)) once
/// the path has been quiet for the configured stability window, so files
/// still being written are not picked up half-way.
pub struct DebouncedChangeQueue {
    /// Pending changes keyed by path, storing the merged event and its timestamp
    pending: HashMap<PathBuf, (WatchEvent, Instant)>,
    /// Minimum quiet period before a change is considered settled
    debounce_delay: Duration,
}

impl DebouncedChangeQueue {
    /// Creates a new `DebouncedChangeQueue` with the given stability window
    pub fn new(debounce_delay: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            debounce_delay,
        }
    }

    /// Inserts or merges a change event for its path
    ///
    /// `Ready` carries no path and is ignored here.
    pub fn push(&mut self, event: WatchEvent) {
        let Some(path) = event.path().map(Path::to_path_buf) else {
            return;
        };

        let merged = match self.pending.remove(&path) {
            Some((previous, _)) => previous.merge(event),
            None => event,
        };
        debug!(path = %path.display(), event = ?merged, "Enqueuing change event");
        self.pending.insert(path, (merged, Instant::now()));
    }

    /// Returns all changes that have been quiet for the stability window
    ///
    /// Settled events are removed from the pending queue and returned.
    /// Events that are still within the window remain pending.
    pub fn poll(&mut self) -> Vec<WatchEvent> {
        let now = Instant::now();
        let settled_paths: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, ts))| now.duration_since(*ts) >= self.debounce_delay)
            .map(|(path, _)| path.clone())
            .collect();

        let settled: Vec<WatchEvent> = settled_paths
            .iter()
            .filter_map(|path| self.pending.remove(path).map(|(event, _)| event))
            .collect();

        if !settled.is_empty() {
            debug!(count = settled.len(), "Polled settled change events");
        }

        settled
    }

    /// Remove and return every pending event regardless of age
    pub fn drain(&mut self) -> Vec<WatchEvent> {
        self.pending.drain().map(|(_, (event, _))| event).collect()
    }

    /// Returns the number of pending (unsettled) events
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if there are no pending events
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
