//! Watcher that stats each file on a fixed interval.
//!
//! Used where native notifications are unavailable or exhausted. Every
//! watched path gets its own task; the task compares the file's mode,
//! size, modification time and identity against the previous stat.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, WatchError};
use crate::event::{FileEvent, Op, WatchChannels, WatchSenders, watch_channels};
use crate::identity::{FileId, file_id, mode_of};
use crate::watcher::{FileWatcher, WatcherKind};

/// Default time between stats of a watched file.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileState {
    mode: u32,
    len: u64,
    modified: Option<SystemTime>,
    id: Option<FileId>,
}

impl From<&std::fs::Metadata> for FileState {
    fn from(meta: &std::fs::Metadata) -> Self {
        Self {
            mode: mode_of(meta),
            len: meta.len(),
            modified: meta.modified().ok(),
            id: file_id(meta),
        }
    }
}

impl FileState {
    fn change_since(&self, prev: &Self) -> Option<Op> {
        match (prev.id, self.id) {
            (Some(a), Some(b)) if a != b => return Some(Op::Rename),
            _ => {}
        }
        if self.mode != prev.mode {
            Some(Op::Chmod)
        } else if self.modified != prev.modified || self.len != prev.len {
            Some(Op::Write)
        } else {
            None
        }
    }
}

/// Stat-based watcher.
///
/// Must be used within a Tokio runtime.
pub struct PollingWatcher {
    interval: Duration,
    watches: HashMap<PathBuf, CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
    senders: Option<WatchSenders>,
    channels: WatchChannels,
}

impl PollingWatcher {
    /// Creates a poller using [`DEFAULT_POLL_INTERVAL`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Creates a poller with a custom interval.
    #[must_use]
    pub fn with_interval(interval: Duration) -> Self {
        let (senders, channels) = watch_channels();
        Self {
            interval,
            watches: HashMap::new(),
            tasks: Vec::new(),
            senders: Some(senders),
            channels,
        }
    }
}

impl Default for PollingWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FileWatcher for PollingWatcher {
    fn add(&mut self, path: &Path) -> Result<()> {
        let senders = self.senders.as_ref().ok_or(WatchError::Closed)?;
        if self.watches.contains_key(path) {
            return Err(WatchError::AlreadyWatched(path.to_path_buf()));
        }
        let meta = std::fs::metadata(path)?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_file(
            path.to_path_buf(),
            FileState::from(&meta),
            self.interval,
            cancel.clone(),
            senders.clone(),
        ));
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
        self.watches.insert(path.to_path_buf(), cancel);
        debug!(path = %path.display(), interval_ms = self.interval.as_millis() as u64, "poll watch added");
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        if self.senders.is_none() {
            return Err(WatchError::Closed);
        }
        let cancel = self
            .watches
            .remove(path)
            .ok_or_else(|| WatchError::NotWatched(path.to_path_buf()))?;
        cancel.cancel();
        Ok(())
    }

    fn channels(&mut self) -> &mut WatchChannels {
        &mut self.channels
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        self.senders = None;
        for (_, cancel) in self.watches.drain() {
            cancel.cancel();
        }
        let tasks = std::mem::take(&mut self.tasks);
        async move {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "poll task failed");
                }
            }
        }
        .boxed()
    }

    fn kind(&self) -> WatcherKind {
        WatcherKind::Polling
    }
}

impl Drop for PollingWatcher {
    fn drop(&mut self) {
        for cancel in self.watches.values() {
            cancel.cancel();
        }
    }
}

async fn poll_file(
    path: PathBuf,
    initial: FileState,
    interval: Duration,
    cancel: CancellationToken,
    senders: WatchSenders,
) {
    let mut last = Some(initial);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let op = match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                let state = FileState::from(&meta);
                let op = match &last {
                    None => Some(Op::Create),
                    Some(prev) => state.change_since(prev),
                };
                last = Some(state);
                op
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                last.take().map(|_| Op::Remove)
            }
            Err(e) => {
                if senders.errors.send(e.into()).is_err() {
                    return;
                }
                None
            }
        };

        if let Some(op) = op {
            if senders.events.send(FileEvent::new(path.clone(), op)).is_err() {
                return;
            }
        }
    }
}
