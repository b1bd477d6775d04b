//! Watcher backed by the platform's change notification API.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use futures::FutureExt;
use futures::future::BoxFuture;
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::debug;

use crate::error::{Result, WatchError};
use crate::event::{FileEvent, Op, WatchChannels, watch_channels};
use crate::watcher::{FileWatcher, WatcherKind};

/// Watcher using inotify, FSEvents or the equivalent native backend.
pub struct NativeWatcher {
    watcher: Option<RecommendedWatcher>,
    watched: HashSet<PathBuf>,
    channels: WatchChannels,
}

impl NativeWatcher {
    /// Creates a watcher with no watched paths.
    ///
    /// # Errors
    ///
    /// Returns an error if the native backend cannot be initialised, for
    /// example when the per-user instance limit is reached.
    pub fn new() -> Result<Self> {
        let (senders, channels) = watch_channels();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                for ev in translate(&event) {
                    if senders.events.send(ev).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = senders.errors.send(WatchError::Native(e));
            }
        })?;

        Ok(Self {
            watcher: Some(watcher),
            watched: HashSet::new(),
            channels,
        })
    }
}

fn translate(event: &notify::Event) -> Vec<FileEvent> {
    let op = match event.kind {
        EventKind::Create(_) => Op::Create,
        EventKind::Modify(ModifyKind::Name(_)) => Op::Rename,
        EventKind::Modify(ModifyKind::Metadata(_)) => Op::Chmod,
        EventKind::Modify(_) | EventKind::Any => Op::Write,
        EventKind::Remove(_) => Op::Remove,
        EventKind::Access(_) | EventKind::Other => return Vec::new(),
    };
    event
        .paths
        .iter()
        .map(|path| FileEvent::new(path.clone(), op))
        .collect()
}

impl FileWatcher for NativeWatcher {
    fn add(&mut self, path: &Path) -> Result<()> {
        let watcher = self.watcher.as_mut().ok_or(WatchError::Closed)?;
        if self.watched.contains(path) {
            return Err(WatchError::AlreadyWatched(path.to_path_buf()));
        }
        watcher.watch(path, RecursiveMode::NonRecursive)?;
        self.watched.insert(path.to_path_buf());
        debug!(path = %path.display(), "native watch added");
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        let watcher = self.watcher.as_mut().ok_or(WatchError::Closed)?;
        if !self.watched.remove(path) {
            return Err(WatchError::NotWatched(path.to_path_buf()));
        }
        match watcher.unwatch(path) {
            Ok(()) => Ok(()),
            // The kernel drops watches on deleted files by itself.
            Err(e) if matches!(e.kind, notify::ErrorKind::WatchNotFound) => {
                debug!(path = %path.display(), "native watch already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn channels(&mut self) -> &mut WatchChannels {
        &mut self.channels
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        // Dropping the backend stops its thread and closes both channels.
        self.watcher = None;
        self.watched.clear();
        async {}.boxed()
    }

    fn kind(&self) -> WatcherKind {
        WatcherKind::Native
    }
}
