//! Debounced recursive file watching.
//!
//! [`RecursiveWatcher`] registers every directory below a root and fires on
//! any create, write, rename or remove beneath it. New directories are
//! registered as they appear. [`Debouncer`] collapses a burst of firings into
//! one downstream call.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{io_err, RuntimeError};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

// ---------------------------------------------------------------------------
// Debouncer
// ---------------------------------------------------------------------------

pub struct Debouncer {
    window: Duration,
    queued: Arc<AtomicBool>,
    downstream: ChangeCallback,
    closed: CancellationToken,
}

impl Debouncer {
    pub fn new(window: Duration, downstream: ChangeCallback) -> Self {
        Self {
            window,
            queued: Arc::new(AtomicBool::new(false)),
            downstream,
            closed: CancellationToken::new(),
        }
    }

    /// Schedules one downstream call `window` from now unless one is
    /// already queued.
    pub fn on_change(&self) {
        if self.closed.is_cancelled() || self.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let window = self.window;
        let queued = self.queued.clone();
        let downstream = self.downstream.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {}
                _ = tokio::time::sleep(window) => {
                    downstream();
                    queued.store(false, Ordering::Release);
                }
            }
        });
    }

    /// Drops any queued call; later changes are ignored.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// A callback that feeds this debouncer, for use as a watcher's sink.
    pub fn as_callback(self: &Arc<Self>) -> ChangeCallback {
        let debouncer = self.clone();
        Arc::new(move || debouncer.on_change())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

// ---------------------------------------------------------------------------
// Recursive watcher
// ---------------------------------------------------------------------------

pub struct RecursiveWatcher {
    root: PathBuf,
    closed: CancellationToken,
}

impl RecursiveWatcher {
    /// Registers the tree under `root` and starts delivering changes.
    pub fn start(root: &Path, on_change: ChangeCallback) -> Result<Self, RuntimeError> {
        // Canonicalize so that event paths (which arrive as real paths, e.g.
        // /private/var/... on macOS) match the `starts_with` checks below.
        let root = fs::canonicalize(root).map_err(|e| io_err(root, e))?;

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let watcher: RecommendedWatcher = recommended_watcher(move |event| {
            let _ = event_tx.send(event);
        })?;

        let mut watched = WatchSet {
            watcher,
            dirs: HashSet::new(),
        };
        let dirs = watched.add_tree(&root)?;
        tracing::info!(root = %root.display(), dirs, "watching for changes");

        let closed = CancellationToken::new();
        let task_closed = closed.clone();
        let task_root = root.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = task_closed.cancelled() => break,
                    event = event_rx.recv() => event,
                };
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

                for dir in event.paths.iter().filter(|path| path.starts_with(&task_root) && path.is_dir()) {
                    match watched.add_tree(dir) {
                        Ok(0) => {}
                        Ok(added) => tracing::debug!(path = %dir.display(), added, "watching new directories"),
                        Err(err) => tracing::warn!(path = %dir.display(), error = %err, "new directory not watched"),
                    }
                }
                tracing::trace!(paths = ?event.paths, kind = ?event.kind, "file change");
                on_change();
            }
            // Releases the OS watch handles.
            drop(watched);
        });

        Ok(Self { root, closed })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stops delivery and releases the watch handles.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for RecursiveWatcher {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Directories already handed to the OS watcher, keyed by canonical path.
struct WatchSet {
    watcher: RecommendedWatcher,
    dirs: HashSet<PathBuf>,
}

impl WatchSet {
    /// Walks `top` and watches every directory not watched yet. Returns how
    /// many were added. Symlinked directories are not followed.
    fn add_tree(&mut self, top: &Path) -> Result<usize, RuntimeError> {
        let mut added = 0;
        let mut pending = vec![top.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let Some(dir) = existing(fs::canonicalize(&dir), &dir)? else {
                continue;
            };
            if self.dirs.insert(dir.clone()) {
                self.watcher.watch(&dir, RecursiveMode::NonRecursive)?;
                added += 1;
            }

            let Some(entries) = existing(fs::read_dir(&dir), &dir)? else {
                continue;
            };
            for entry in entries {
                let entry = entry.map_err(|e| io_err(&dir, e))?;
                if entry.file_type().map_err(|e| io_err(entry.path(), e))?.is_dir() {
                    pending.push(entry.path());
                }
            }
        }
        Ok(added)
    }
}

/// A directory removed mid-walk is skipped rather than failing the walk.
fn existing<T>(result: std::io::Result<T>, path: &Path) -> Result<Option<T>, RuntimeError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Any | EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
