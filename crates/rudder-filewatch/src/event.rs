//! Change notifications delivered by watchers.

use std::fmt;
use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::error::WatchError;

/// Kind of change observed on a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// The path appeared.
    Create,
    /// File contents changed.
    Write,
    /// The path was deleted.
    Remove,
    /// The path was moved away or replaced by another file.
    Rename,
    /// Permissions or other metadata changed.
    Chmod,
}

impl Op {
    /// Returns true if the watched file may no longer be the file at its path.
    #[must_use]
    pub const fn is_replacement(self) -> bool {
        matches!(self, Self::Remove | Self::Rename)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "CREATE",
            Self::Write => "WRITE",
            Self::Remove => "REMOVE",
            Self::Rename => "RENAME",
            Self::Chmod => "CHMOD",
        };
        f.write_str(s)
    }
}

/// One observed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Path the change applies to.
    pub path: PathBuf,
    /// What happened.
    pub op: Op,
}

impl FileEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, op: Op) -> Self {
        Self {
            path: path.into(),
            op,
        }
    }
}

impl fmt::Display for FileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.path.display())
    }
}

/// Receiving ends of a watcher's event and error streams.
///
/// Kept in one struct so both can be polled from the same `select!`.
#[derive(Debug)]
pub struct WatchChannels {
    /// Change notifications.
    pub events: mpsc::UnboundedReceiver<FileEvent>,
    /// Backend failures.
    pub errors: mpsc::UnboundedReceiver<WatchError>,
}

/// Sending ends matching a [`WatchChannels`].
#[derive(Debug, Clone)]
pub(crate) struct WatchSenders {
    pub(crate) events: mpsc::UnboundedSender<FileEvent>,
    pub(crate) errors: mpsc::UnboundedSender<WatchError>,
}

pub(crate) fn watch_channels() -> (WatchSenders, WatchChannels) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (error_tx, error_rx) = mpsc::unbounded_channel();
    (
        WatchSenders {
            events: event_tx,
            errors: error_tx,
        },
        WatchChannels {
            events: event_rx,
            errors: error_rx,
        },
    )
}
