//! Fan-out watcher for the request directory.
//!
//! One OS-native watch (kqueue on macOS, inotify on Linux, via the `notify`
//! crate) is shared by any number of subscribers. Each subscriber gets its
//! own bounded queue and consumes at its own pace.
//!
//! # Architecture
//!
//! ```text
//! notify callback ──std mpsc──► blocking dispatch task
//!                                   │ lock registry, try_send, unlock
//!                     ┌─────────────┼─────────────┐
//!                     ▼             ▼             ▼
//!               Subscription   Subscription   Subscription
//!               (queue of 10)  (queue of 10)  (queue of 10)
//! ```
//!
//! Delivery is at-most-once per subscriber: an event is dropped for a
//! subscriber whose queue is full. The dispatcher never waits on a slow
//! subscriber. A dropped event is only a missed wake-up, since the
//! directory can be listed again ([`MultiWatcher::add_with_backlog`]).

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::constants::SUBSCRIBER_QUEUE_CAPACITY;

/// Classification of a file system event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// A new file (a requester endpoint) was created.
    Create,
    /// File content or metadata was modified (not a rename).
    Modify,
    /// A file was renamed or moved.
    Rename,
    /// A file was deleted.
    Delete,
    /// Event type not mapped to a specific category.
    Other,
}

/// A single file system event with path and classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Path of the affected file.
    pub path: PathBuf,
    /// What happened to the file.
    pub kind: FileEventKind,
}

impl FileEvent {
    /// Final path component as UTF-8, i.e. the request id for endpoints.
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    /// Classify a raw `notify::Event` into one [`FileEvent`] per path.
    pub fn from_notify(event: &notify::Event) -> Vec<Self> {
        let kind = classify(&event.kind);
        event
            .paths
            .iter()
            .map(|p| Self { path: p.clone(), kind })
            .collect()
    }
}

/// Map `notify::EventKind` to [`FileEventKind`].
fn classify(kind: &notify::EventKind) -> FileEventKind {
    match kind {
        notify::EventKind::Create(_) => FileEventKind::Create,
        notify::EventKind::Modify(notify::event::ModifyKind::Name(_)) => FileEventKind::Rename,
        notify::EventKind::Modify(_) => FileEventKind::Modify,
        notify::EventKind::Remove(_) => FileEventKind::Delete,
        _ => FileEventKind::Other,
    }
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::Sender<FileEvent>>,
}

/// Subscriber registry and non-blocking dispatch.
///
/// The lock guards only the subscriber map. It is taken for registration,
/// removal, and one pass of `try_send` calls, never across a blocking read.
#[derive(Debug, Clone, Default)]
pub struct FanOut {
    registry: Arc<Mutex<Registry>>,
}

impl FanOut {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber with a queue of
    /// [`SUBSCRIBER_QUEUE_CAPACITY`] events.
    pub fn add(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let mut registry = self.registry.lock().expect("watcher registry poisoned");
        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscribers.insert(id, tx);
        log::debug!("[Watcher] Subscriber {id} added ({} active)", registry.subscribers.len());

        Subscription {
            id,
            rx,
            backlog: VecDeque::new(),
            listed: HashSet::new(),
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Offer `event` to every subscriber without blocking.
    ///
    /// Returns the number of subscribers that accepted it. Subscribers with
    /// a full queue miss this event; subscribers whose receiver is gone are
    /// pruned.
    pub fn dispatch(&self, event: &FileEvent) -> usize {
        let mut registry = self.registry.lock().expect("watcher registry poisoned");
        let mut delivered = 0;
        registry.subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                log::debug!("[Watcher] Subscriber {id} queue full, dropping {:?}", event.path);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .expect("watcher registry poisoned")
            .subscribers
            .len()
    }

    /// Whether no subscriber is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deregister everyone; all subscription streams end.
    pub fn close_all(&self) {
        self.registry
            .lock()
            .expect("watcher registry poisoned")
            .subscribers
            .clear();
    }
}

fn deregister(registry: &Weak<Mutex<Registry>>, id: u64) {
    if let Some(registry) = registry.upgrade() {
        let mut registry = registry.lock().expect("watcher registry poisoned");
        if registry.subscribers.remove(&id).is_some() {
            log::debug!("[Watcher] Subscriber {id} removed ({} active)", registry.subscribers.len());
        }
    }
}

/// A subscriber's handle on the event stream.
///
/// Cancelled exactly once: by [`cancel`](Self::cancel), which consumes the
/// handle, or on drop. Cancellation removes the queue from the registry, so
/// the dispatcher stops offering events to it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<FileEvent>,
    /// Synthetic creation events from the directory listing.
    backlog: VecDeque<FileEvent>,
    /// Paths already delivered from the listing; a live `Create` for one of
    /// these is suppressed once.
    listed: HashSet<PathBuf>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Registry id of this subscription.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue catch-up creation events for `paths` ahead of live events.
    pub fn with_backlog(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        for path in paths {
            if self.listed.insert(path.clone()) {
                self.backlog.push_back(FileEvent {
                    path,
                    kind: FileEventKind::Create,
                });
            }
        }
        self
    }

    /// Next event: backlog first, then live events.
    ///
    /// Returns `None` once the watcher has shut down.
    pub async fn recv(&mut self) -> Option<FileEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            let event = self.rx.recv().await?;
            if self.is_duplicate(&event) {
                continue;
            }
            return Some(event);
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<FileEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            let event = self.rx.try_recv().ok()?;
            if self.is_duplicate(&event) {
                continue;
            }
            return Some(event);
        }
    }

    fn is_duplicate(&mut self, event: &FileEvent) -> bool {
        match event.kind {
            FileEventKind::Create => self.listed.remove(&event.path),
            // A listed path that goes away may come back as a new request.
            FileEventKind::Delete | FileEventKind::Rename => {
                self.listed.remove(&event.path);
                false
            }
            FileEventKind::Modify | FileEventKind::Other => false,
        }
    }

    /// Deregister and release the queue.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
        deregister(&self.registry, self.id);
    }
}

/// One OS watch over a directory, fanned out to many subscribers.
///
/// Constructed explicitly at process start and passed to whatever needs to
/// subscribe. Dropping it stops the OS watch; the dispatch task then exits
/// and every subscription stream ends.
pub struct MultiWatcher {
    dir: PathBuf,
    watcher: Option<RecommendedWatcher>,
    fan_out: FanOut,
    dispatch_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MultiWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiWatcher")
            .field("dir", &self.dir)
            .field("subscribers", &self.fan_out.len())
            .finish_non_exhaustive()
    }
}

impl MultiWatcher {
    /// Start watching `dir` (non-recursively) and spawn the dispatch task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS watcher cannot be created or `dir` cannot
    /// be watched (missing directory, inotify limits).
    pub fn start(dir: &Path) -> Result<Self> {
        let (tx, rx) = std::sync::mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .context("Failed to create file watcher")?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch: {}", dir.display()))?;

        let fan_out = FanOut::new();
        let dispatch_fan_out = fan_out.clone();
        // Blocking recv; wakes only when the OS delivers an event. Ends when
        // the watcher (and with it the sender) is dropped.
        let dispatch_handle = tokio::task::spawn_blocking(move || {
            while let Ok(result) = rx.recv() {
                match result {
                    Ok(event) => {
                        for file_event in FileEvent::from_notify(&event) {
                            dispatch_fan_out.dispatch(&file_event);
                        }
                    }
                    Err(e) => log::warn!("[Watcher] File watcher error: {e}"),
                }
            }
            dispatch_fan_out.close_all();
            log::debug!("[Watcher] Dispatch loop exited");
        });

        log::info!("[Watcher] Watching for requests in {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            watcher: Some(watcher),
            fan_out,
            dispatch_handle: Some(dispatch_handle),
        })
    }

    /// Subscribe to live events only.
    pub fn add(&self) -> Subscription {
        self.fan_out.add()
    }

    /// Subscribe, then list the directory; every existing entry is delivered
    /// as a creation event before any live event.
    ///
    /// Registration happens before the listing so nothing created in
    /// between is missed.
    pub fn add_with_backlog(&self) -> Result<Subscription> {
        let subscription = self.fan_out.add();
        let mut existing = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list {}", self.dir.display()))?
        {
            existing.push(entry?.path());
        }
        existing.sort();
        for path in &existing {
            log::info!("[Watcher] Pre-existing request {}", path.display());
        }
        Ok(subscription.with_backlog(existing))
    }

    /// Number of active subscribers.
    pub fn len(&self) -> usize {
        self.fan_out.len()
    }

    /// Whether no subscriber is registered.
    pub fn is_empty(&self) -> bool {
        self.fan_out.is_empty()
    }

    /// Stop the OS watch and end all subscriptions.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.watcher.take().is_some() {
            log::info!("[Watcher] Stopped watching {}", self.dir.display());
        }
        // The dispatch task exits on its own once the sender is gone.
        self.dispatch_handle.take();
        self.fan_out.close_all();
    }
}

impl Drop for MultiWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
