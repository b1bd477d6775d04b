//! # rudder-filewatch
//!
//! Per-file change notifications for log readers.
//!
//! Two backends implement [`FileWatcher`]:
//!
//! - [`NativeWatcher`] - Kernel notifications through `notify`
//! - [`PollingWatcher`] - Periodic stat, for when native watches are
//!   unavailable or exhausted
//!
//! [`new_watcher`] and [`watch_file`] pick the native backend and fall back
//! to polling on failure.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rudder_filewatch::{watch_file, Op};
//!
//! # async fn example() -> rudder_filewatch::Result<()> {
//! let mut watcher = watch_file(std::path::Path::new("/var/log/app.log"))?;
//! while let Some(event) = watcher.events().recv().await {
//!     if event.op == Op::Write {
//!         // read more
//!     }
//! }
//! watcher.close().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod event;
pub mod identity;
pub mod native;
pub mod polling;
pub mod watcher;

use std::path::Path;

use tracing::warn;

pub use error::{Result, WatchError};
pub use event::{FileEvent, Op, WatchChannels};
pub use identity::{FileId, file_id, same_file};
pub use native::NativeWatcher;
pub use polling::{DEFAULT_POLL_INTERVAL, PollingWatcher};
pub use watcher::{FileWatcher, WatcherKind};

/// Creates a native watcher, or a poller if the native backend fails.
///
/// Must be called within a Tokio runtime.
#[must_use]
pub fn new_watcher() -> Box<dyn FileWatcher> {
    match NativeWatcher::new() {
        Ok(w) => Box::new(w),
        Err(e) => {
            warn!(error = %e, "native file watcher unavailable, falling back to polling");
            Box::new(PollingWatcher::new())
        }
    }
}

/// Creates a watcher already watching `path`.
///
/// If the native backend cannot watch the file, a poller is used instead.
///
/// # Errors
///
/// Returns an error if neither backend can watch the file.
pub fn watch_file(path: &Path) -> Result<Box<dyn FileWatcher>> {
    let mut watcher = new_watcher();
    match watcher.add(path) {
        Ok(()) => Ok(watcher),
        Err(e) if watcher.kind() == WatcherKind::Native => {
            warn!(path = %path.display(), error = %e, "native watch failed, falling back to polling");
            drop(watcher);
            let mut poller = PollingWatcher::new();
            poller.add(path)?;
            Ok(Box::new(poller))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watch_file_missing_path_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(watch_file(&dir.path().join("nope.log")).is_err());
    }

    #[tokio::test]
    async fn watch_file_existing_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ok.log");
        std::fs::write(&path, b"").expect("create");
        let mut watcher = watch_file(&path).expect("watch");
        assert!(matches!(watcher.add(&path), Err(WatchError::AlreadyWatched(_))));
        watcher.close().await;
    }
}
