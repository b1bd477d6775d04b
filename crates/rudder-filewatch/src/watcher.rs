//! The watcher abstraction shared by both backends.

use std::fmt;
use std::path::Path;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::{Result, WatchError};
use crate::event::{FileEvent, WatchChannels};

/// Which backend a watcher uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherKind {
    /// Kernel notifications.
    Native,
    /// Periodic stat.
    Polling,
}

impl fmt::Display for WatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => f.write_str("native"),
            Self::Polling => f.write_str("polling"),
        }
    }
}

/// Watches individual files for changes.
///
/// Events and errors arrive on separate channels. After [`close`] both
/// channels end once buffered items are consumed, and `add`/`remove`
/// return [`WatchError::Closed`].
///
/// [`close`]: FileWatcher::close
pub trait FileWatcher: Send {
    /// Starts watching `path`.
    ///
    /// # Errors
    ///
    /// Fails if the path is already watched, cannot be watched, or the
    /// watcher is closed.
    fn add(&mut self, path: &Path) -> Result<()>;

    /// Stops watching `path`.
    ///
    /// # Errors
    ///
    /// Fails if the path is not watched or the watcher is closed.
    fn remove(&mut self, path: &Path) -> Result<()>;

    /// Both receiving channels, for use in one `select!`.
    fn channels(&mut self) -> &mut WatchChannels;

    /// Stops all watches and releases resources.
    fn close(&mut self) -> BoxFuture<'_, ()>;

    /// Backend in use.
    fn kind(&self) -> WatcherKind;

    /// Change notifications.
    fn events(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.channels().events
    }

    /// Backend failures.
    fn errors(&mut self) -> &mut mpsc::UnboundedReceiver<WatchError> {
        &mut self.channels().errors
    }
}
