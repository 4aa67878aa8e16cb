//! Recursive plugin source watcher with a single resettable debounce timer.
//!
//! Raw notify events are filtered (dotfiles, `node_modules`, `dist`) and fed
//! into a debounce loop on its own thread. Every accepted event pushes the
//! deadline out again; when the deadline passes quietly, one
//! [`WatchEvent::Change`] is emitted carrying the last accepted event only.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use notify::event::{ModifyKind, RenameMode};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::error::{Error, Result};

/// Directory names never observed, wherever they appear under the root.
const IGNORED_DIRS: &[&str] = &["node_modules", "dist"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Removed => "removed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Monitoring is active.
    Ready,
    /// A debounce window closed.
    Change(ChangeEvent),
    /// The root is gone or the backend failed. Monitoring should be restarted.
    Error(String),
}

/// The watched root as given and as canonicalized, so event paths can be
/// made relative regardless of which form the backend reports.
#[derive(Debug, Clone)]
struct WatchRoot {
    given: PathBuf,
    canonical: PathBuf,
}

impl WatchRoot {
    fn new(given: &Path) -> Self {
        Self {
            given: given.to_path_buf(),
            canonical: given.canonicalize().unwrap_or_else(|_| given.to_path_buf()),
        }
    }

    fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.given)
            .or_else(|_| path.strip_prefix(&self.canonical))
            .ok()
    }

    fn is_root(&self, path: &Path) -> bool {
        path == self.given || path == self.canonical
    }
}

/// Returns true for paths the watcher must never report: anything below a
/// hidden component or a build/dependency directory.
pub fn is_ignored(root: &Path, path: &Path) -> bool {
    is_ignored_under(&WatchRoot::new(root), path)
}

fn is_ignored_under(root: &WatchRoot, path: &Path) -> bool {
    match root.relative(path) {
        Some(relative) => relative.components().any(|component| match component {
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                name.starts_with('.') || IGNORED_DIRS.contains(&name.as_ref())
            }
            _ => false,
        }),
        // Outside the root: judge by the file name alone
        None => path
            .file_name()
            .map(|name| name.to_string_lossy().starts_with('.'))
            .unwrap_or(false),
    }
}

/// Map a notify event kind onto the three change kinds we report.
pub(crate) fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Added),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(ChangeKind::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(ChangeKind::Added),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        _ => None,
    }
}

fn accept(root: &WatchRoot, event: &Event) -> Option<ChangeEvent> {
    let kind = classify(&event.kind)?;
    let path = event
        .paths
        .iter()
        .rev()
        .find(|p| !is_ignored_under(root, p))?;
    Some(ChangeEvent {
        kind,
        path: path.clone(),
    })
}

struct WatchSession {
    _backend: RecommendedWatcher,
    cancelled: Arc<AtomicBool>,
}

impl WatchSession {
    fn close(self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Dropping the backend closes the raw event channel, which ends the
        // debounce thread without firing its pending timer.
    }
}

pub struct Watcher {
    root: PathBuf,
    debounce: Duration,
    events: UnboundedSender<WatchEvent>,
    session: Option<WatchSession>,
}

impl Watcher {
    pub fn new(root: impl Into<PathBuf>, debounce: Duration) -> (Self, UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = unbounded_channel();
        let watcher = Self {
            root: root.into(),
            debounce,
            events: tx,
            session: None,
        };
        (watcher, rx)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Begin monitoring. Any previous session is closed first so a restart
    /// never produces two notification streams.
    pub fn start(&mut self) -> Result<()> {
        self.stop();

        if !self.root.is_dir() {
            let msg = format!("watch root {} does not exist", self.root.display());
            let _ = self.events.send(WatchEvent::Error(msg.clone()));
            return Err(Error::Configuration(msg));
        }

        let (raw_tx, raw_rx) = std::sync::mpsc::channel::<notify::Result<Event>>();
        let mut backend = RecommendedWatcher::new(raw_tx, notify::Config::default())
            .map_err(|e| self.backend_failure("create watcher", e))?;
        backend
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| self.backend_failure("watch directory", e))?;

        let cancelled = Arc::new(AtomicBool::new(false));
        let root = WatchRoot::new(&self.root);
        let events = self.events.clone();
        let delay = self.debounce;
        let flag = cancelled.clone();
        std::thread::Builder::new()
            .name("hot-reload-watcher".into())
            .spawn(move || debounce_loop(raw_rx, root, delay, events, flag))?;

        tracing::info!("Watching {} (debounce {}ms)", self.root.display(), delay.as_millis());
        self.session = Some(WatchSession {
            _backend: backend,
            cancelled,
        });
        let _ = self.events.send(WatchEvent::Ready);
        Ok(())
    }

    /// Halt monitoring and drop any not-yet-fired notification. Safe to call
    /// repeatedly.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
            tracing::info!("Stopped watching {}", self.root.display());
        }
    }

    fn backend_failure(&self, action: &str, err: notify::Error) -> Error {
        let msg = format!("failed to {action} for {}: {err}", self.root.display());
        let _ = self.events.send(WatchEvent::Error(msg.clone()));
        Error::Io(std::io::Error::other(msg))
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Coalesce raw events: one timer, reset by every accepted event, firing the
/// most recent event once it expires.
fn debounce_loop(
    rx: Receiver<notify::Result<Event>>,
    root: WatchRoot,
    delay: Duration,
    events: UnboundedSender<WatchEvent>,
    cancelled: Arc<AtomicBool>,
) {
    let emit = |event: WatchEvent| -> bool {
        if cancelled.load(Ordering::SeqCst) {
            return false;
        }
        events.send(event).is_ok()
    };

    let mut pending: Option<ChangeEvent> = None;
    let mut deadline = Instant::now();

    loop {
        let received = if pending.is_some() {
            rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
        } else {
            rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
        };

        match received {
            Ok(Ok(event)) => {
                if matches!(event.kind, EventKind::Remove(_))
                    && event.paths.iter().any(|p| root.is_root(p))
                {
                    pending = None;
                    if !emit(WatchEvent::Error(format!(
                        "watch root {} was removed",
                        root.given.display()
                    ))) {
                        return;
                    }
                    continue;
                }
                if let Some(change) = accept(&root, &event) {
                    tracing::debug!("raw {} event: {}", change.kind, change.path.display());
                    pending = Some(change);
                    deadline = Instant::now() + delay;
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("Watcher error: {e}");
                if !emit(WatchEvent::Error(e.to_string())) {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(change) = pending.take()
                    && !emit(WatchEvent::Change(change))
                {
                    return;
                }
            }
            // Backend dropped: the session was stopped
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
