//! Reference-counted decompressed copies of compressed generations.
//!
//! Readers that need a `name.k.gz` generation share one decompressed
//! temporary file. Each reader holds a [`TempFileRef`]; the file is deleted
//! when the last handle is dropped, on every exit path.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use parking_lot::Mutex;
use rudder_filewatch::{FileId, file_id};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

/// Contents of the gzip header's extra field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct GzipExtra {
    #[serde(rename = "lastTime")]
    pub(crate) last_time: DateTime<Utc>,
}

/// Reads the last record time recorded in a compressed generation.
///
/// Only the gzip header is read; the body is not decompressed.
pub async fn last_timestamp(gz_path: &Path) -> Result<Option<DateTime<Utc>>> {
    let path = gz_path.to_path_buf();
    let last = tokio::task::spawn_blocking(move || -> std::io::Result<_> {
        let decoder = GzDecoder::new(BufReader::new(File::open(&path)?));
        Ok(decoder
            .header()
            .and_then(|h| h.extra())
            .and_then(|extra| serde_json::from_slice::<GzipExtra>(extra).ok())
            .map(|extra| extra.last_time))
    })
    .await??;
    Ok(last)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TempKey {
    source: PathBuf,
    id: Option<FileId>,
}

#[derive(Debug)]
struct TempEntry {
    path: PathBuf,
    ready: OnceCell<()>,
}

#[derive(Debug)]
struct Slot {
    entry: Arc<TempEntry>,
    refs: usize,
}

/// Table of decompressed generations in use.
#[derive(Debug, Default)]
pub struct DecompressedFiles {
    slots: Mutex<HashMap<TempKey, Slot>>,
    decompressions: AtomicU64,
}

impl DecompressedFiles {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle to the decompressed copy of `gz_path`.
    ///
    /// The copy is created on first use and shared by every concurrent
    /// handle for the same compressed file. The compressed file must exist;
    /// callers hold the rotation lock so it cannot be removed meanwhile.
    pub async fn acquire(self: &Arc<Self>, gz_path: &Path) -> Result<TempFileRef> {
        let meta = tokio::fs::metadata(gz_path).await?;
        let key = TempKey {
            source: gz_path.to_path_buf(),
            id: file_id(&meta),
        };

        let entry = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                entry: Arc::new(TempEntry {
                    path: temp_path_for(gz_path),
                    ready: OnceCell::new(),
                }),
                refs: 0,
            });
            slot.refs += 1;
            Arc::clone(&slot.entry)
        };

        // Dropping the handle on error releases the slot.
        let handle = TempFileRef {
            owner: Arc::clone(self),
            key,
            entry,
        };

        handle
            .entry
            .ready
            .get_or_try_init(|| async {
                self.decompressions.fetch_add(1, Ordering::Relaxed);
                decompress(gz_path.to_path_buf(), handle.entry.path.clone()).await
            })
            .await?;

        Ok(handle)
    }

    /// Number of decompressions performed.
    pub fn decompressions(&self) -> u64 {
        self.decompressions.load(Ordering::Relaxed)
    }

    /// Number of temporary files currently referenced.
    pub fn in_use(&self) -> usize {
        self.slots.lock().len()
    }

    fn release(&self, key: &TempKey) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            return false;
        };
        slot.refs -= 1;
        if slot.refs == 0 {
            slots.remove(key);
            true
        } else {
            false
        }
    }
}

/// Shared handle to one decompressed generation.
#[derive(Debug)]
pub struct TempFileRef {
    owner: Arc<DecompressedFiles>,
    key: TempKey,
    entry: Arc<TempEntry>,
}

impl TempFileRef {
    /// Path of the decompressed copy.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.entry.path
    }
}

impl Drop for TempFileRef {
    fn drop(&mut self) {
        if !self.owner.release(&self.key) {
            return;
        }
        match std::fs::remove_file(&self.entry.path) {
            Ok(()) => debug!(path = %self.entry.path.display(), "removed decompressed log copy"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.entry.path.display(), error = %e, "failed to remove decompressed log copy"),
        }
    }
}

fn temp_path_for(gz_path: &Path) -> PathBuf {
    let mut name = gz_path.with_extension("").into_os_string();
    name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    PathBuf::from(name)
}

async fn decompress(src: PathBuf, dst: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut decoder = GzDecoder::new(BufReader::new(File::open(&src)?));
        let mut out = File::create(&dst)?;
        if let Err(e) = std::io::copy(&mut decoder, &mut out) {
            drop(out);
            let _ = std::fs::remove_file(&dst);
            return Err(e);
        }
        debug!(src = %src.display(), dst = %dst.display(), "decompressed log generation");
        Ok(())
    })
    .await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::GzBuilder;
    use std::io::Write;

    fn write_gz(path: &Path, body: &[u8], last: Option<DateTime<Utc>>) {
        let file = File::create(path).expect("create");
        let mut builder = GzBuilder::new();
        if let Some(last_time) = last {
            builder = builder.extra(serde_json::to_vec(&GzipExtra { last_time }).expect("json"));
        }
        let mut encoder = builder.write(file, Compression::fast());
        encoder.write_all(body).expect("write");
        encoder.finish().expect("finish");
    }

    #[tokio::test]
    async fn shared_copy_deleted_after_last_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gz = dir.path().join("c.log.1.gz");
        write_gz(&gz, b"hello\n", None);

        let files = Arc::new(DecompressedFiles::new());
        let first = files.acquire(&gz).await.expect("first");
        let second = files.acquire(&gz).await.expect("second");

        assert_eq!(first.path(), second.path());
        assert_eq!(files.decompressions(), 1);
        assert_eq!(files.in_use(), 1);
        assert_eq!(std::fs::read(first.path()).expect("read"), b"hello\n");

        let path = first.path().to_path_buf();
        drop(first);
        assert!(path.exists());
        drop(second);
        assert!(!path.exists());
        assert_eq!(files.in_use(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn replaced_source_gets_fresh_copy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gz = dir.path().join("c.log.1.gz");
        write_gz(&gz, b"old\n", None);

        let files = Arc::new(DecompressedFiles::new());
        let old = files.acquire(&gz).await.expect("old");

        // Keep the old inode alive under another name, as rotation does.
        std::fs::rename(&gz, dir.path().join("c.log.2.gz")).expect("shift");
        write_gz(&gz, b"new\n", None);
        let new = files.acquire(&gz).await.expect("new");

        assert_ne!(old.path(), new.path());
        assert_eq!(std::fs::read(new.path()).expect("read"), b"new\n");
        assert_eq!(files.decompressions(), 2);
    }

    #[tokio::test]
    async fn missing_source_fails_without_leaking() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = Arc::new(DecompressedFiles::new());
        assert!(files.acquire(&dir.path().join("none.gz")).await.is_err());
        assert_eq!(files.in_use(), 0);
    }

    #[tokio::test]
    async fn corrupt_source_releases_slot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gz = dir.path().join("bad.gz");
        std::fs::write(&gz, b"definitely not gzip").expect("write");

        let files = Arc::new(DecompressedFiles::new());
        assert!(files.acquire(&gz).await.is_err());
        assert_eq!(files.in_use(), 0);
        let leftovers = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn reads_last_time_from_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gz = dir.path().join("h.gz");
        let when = Utc::now();
        write_gz(&gz, b"x\n", Some(when));
        assert_eq!(last_timestamp(&gz).await.expect("header"), Some(when));

        let plain = dir.path().join("p.gz");
        write_gz(&plain, b"x\n", None);
        assert_eq!(last_timestamp(&plain).await.expect("header"), None);
    }
}
