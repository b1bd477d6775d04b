//! The writable log file and its rotated generations.
//!
//! Generations are `name`, `name.1` .. `name.(max_files-1)`. With
//! compression every generation but the current one ends up as
//! `name.k.gz`; `name.1` is compressed in the background right after a
//! rotation, holding the rotation lock until the `.gz` is in place.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flate2::{Compression, GzBuilder};
use parking_lot::Mutex;
use rudder_logger::{LogWatcher, Message, ReadConfig, log_watcher};
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{JsonFileError, Result};
use crate::jsonlog;
use crate::read;
use crate::tempfiles::{DecompressedFiles, GzipExtra};

/// Rotation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationConfig {
    /// Size at which the current file is rotated; `None` never rotates.
    pub max_size: Option<u64>,
    /// Total generations kept, current file included.
    pub max_files: u32,
    /// Compress generations other than the current file.
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_size: None,
            max_files: 1,
            compress: false,
        }
    }
}

impl RotationConfig {
    /// Rotates at `max_size` bytes keeping `max_files` generations.
    #[must_use]
    pub const fn new(max_size: u64, max_files: u32) -> Self {
        Self {
            max_size: Some(max_size),
            max_files,
            compress: false,
        }
    }

    /// Enables compression of rotated generations.
    #[must_use]
    pub const fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

/// Path of generation `k` of `base`.
#[must_use]
pub fn generation_path(base: &Path, k: u32, compressed: bool) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{k}"));
    if compressed {
        name.push(".gz");
    }
    PathBuf::from(name)
}

struct WriterState {
    file: Option<tokio::fs::File>,
    size: u64,
    last_timestamp: Option<DateTime<Utc>>,
    closed: bool,
}

pub(crate) struct Shared {
    pub(crate) path: PathBuf,
    pub(crate) config: RotationConfig,
    writer: tokio::sync::Mutex<WriterState>,
    pub(crate) rotate_lock: Arc<RwLock<()>>,
    pub(crate) closed: CancellationToken,
    pub(crate) decompressed: Arc<DecompressedFiles>,
    compression: Mutex<Option<JoinHandle<()>>>,
}

/// An append-only log file with size-based rotation.
///
/// Cloning is cheap; clones share the same file.
#[derive(Clone)]
pub struct RotatingLogFile {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RotatingLogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingLogFile")
            .field("path", &self.shared.path)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl RotatingLogFile {
    /// Opens `path` for appending, creating it and its directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl Into<PathBuf>, config: RotationConfig) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        let last_timestamp = if size > 0 {
            last_record_time(&path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "could not read last record time");
                None
            })
        } else {
            None
        };

        debug!(path = %path.display(), size, max_files = config.max_files, "opened log file");
        Ok(Self {
            shared: Arc::new(Shared {
                path,
                config,
                writer: tokio::sync::Mutex::new(WriterState {
                    file: Some(tokio::fs::File::from_std(file)),
                    size,
                    last_timestamp,
                    closed: false,
                }),
                rotate_lock: Arc::new(RwLock::new(())),
                closed: CancellationToken::new(),
                decompressed: Arc::new(DecompressedFiles::new()),
                compression: Mutex::new(None),
            }),
        })
    }

    /// Path of the current file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Rotation settings.
    #[must_use]
    pub fn config(&self) -> RotationConfig {
        self.shared.config
    }

    /// Appends one record, rotating first if it would exceed `max_size`.
    pub async fn write_message(&self, msg: &Message) -> Result<()> {
        let record = jsonlog::encode(msg)?;
        let len = record.len() as u64;

        let mut state = self.shared.writer.lock().await;
        if state.closed {
            return Err(JsonFileError::Closed);
        }
        if let Some(max_size) = self.shared.config.max_size {
            if state.size > 0 && state.size + len > max_size {
                self.shared.rotate(&mut state).await?;
            }
        }

        let file = state.file.as_mut().ok_or(JsonFileError::Closed)?;
        file.write_all(&record).await?;
        file.flush().await?;
        state.size += len;
        state.last_timestamp = Some(msg.timestamp);
        Ok(())
    }

    /// Starts a read session over the retained generations.
    ///
    /// Must be called within a Tokio runtime.
    pub fn read_logs(&self, config: ReadConfig) -> LogWatcher {
        let (producer, watcher) = log_watcher(rudder_logger::DEFAULT_WATCHER_BUFFER);
        tokio::spawn(read::read_session(Arc::clone(&self.shared), config, producer));
        watcher
    }

    /// Number of generations decompressed for readers so far.
    #[must_use]
    pub fn decompressions(&self) -> u64 {
        self.shared.decompressed.decompressions()
    }

    /// Number of decompressed copies currently held by readers.
    #[must_use]
    pub fn decompressed_in_use(&self) -> usize {
        self.shared.decompressed.in_use()
    }

    /// Stops writing, ends follow sessions and waits for compression.
    ///
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.writer.lock().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            if let Some(mut file) = state.file.take() {
                file.flush().await?;
            }
        }
        self.shared.closed.cancel();

        let compression = self.shared.compression.lock().take();
        if let Some(handle) = compression {
            handle.await?;
        }
        debug!(path = %self.shared.path.display(), "closed log file");
        Ok(())
    }
}

impl Shared {
    async fn rotate(&self, state: &mut WriterState) -> Result<()> {
        let guard = Arc::clone(&self.rotate_lock).write_owned().await;
        let max_files = self.config.max_files;

        if max_files < 2 {
            if let Some(file) = state.file.as_mut() {
                file.set_len(0).await?;
            }
            state.size = 0;
            debug!(path = %self.path.display(), "truncated log file");
            return Ok(());
        }

        let compress = self.config.compress;
        let leftover = generation_path(&self.path, 1, false);
        if compress && tokio::fs::try_exists(&leftover).await? {
            // An earlier compression failed; renaming over it would lose it.
            let src = leftover.clone();
            let retried = tokio::task::spawn_blocking(move || {
                let last = last_record_time(&src)?;
                compress_file(&src, last)
            })
            .await?;
            if let Err(e) = retried {
                warn!(
                    path = %leftover.display(),
                    error = %e,
                    "uncompressed generation left behind, postponing rotation"
                );
                return Ok(());
            }
            info!(path = %leftover.display(), "compressed leftover log generation");
        }

        if let Some(mut file) = state.file.take() {
            file.flush().await?;
        }

        remove_if_exists(&generation_path(&self.path, max_files - 1, compress)).await?;
        for k in (2..max_files).rev() {
            rename_if_exists(
                &generation_path(&self.path, k - 1, compress),
                &generation_path(&self.path, k, compress),
            )
            .await?;
        }
        let first = generation_path(&self.path, 1, false);
        tokio::fs::rename(&self.path, &first).await?;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        state.file = Some(file);
        state.size = 0;
        info!(path = %self.path.display(), max_files, "rotated log file");

        if compress {
            let last = state.last_timestamp;
            let handle = tokio::spawn(compress_generation(first, last, guard));
            // Any earlier task held the lock acquired above, so it is done.
            *self.compression.lock() = Some(handle);
        }
        Ok(())
    }
}

async fn compress_generation(
    src: PathBuf,
    last: Option<DateTime<Utc>>,
    _guard: OwnedRwLockWriteGuard<()>,
) {
    let path = src.clone();
    let result = tokio::task::spawn_blocking(move || compress_file(&path, last)).await;
    match result {
        Ok(Ok(())) => debug!(path = %src.display(), "compressed log generation"),
        Ok(Err(e)) => warn!(path = %src.display(), error = %e, "failed to compress log generation"),
        Err(e) => warn!(path = %src.display(), error = %e, "compression task failed"),
    }
}

fn compress_file(src: &Path, last: Option<DateTime<Utc>>) -> std::io::Result<()> {
    let mut gz_name = src.as_os_str().to_owned();
    gz_name.push(".gz");
    let dst = PathBuf::from(gz_name);

    let mut input = BufReader::new(File::open(src)?);
    let mut builder = GzBuilder::new();
    if let Some(last_time) = last {
        let extra = serde_json::to_vec(&GzipExtra { last_time }).map_err(std::io::Error::other)?;
        builder = builder.extra(extra);
    }

    let result = File::create(&dst).and_then(|out| {
        let mut encoder = builder.write(out, Compression::default());
        std::io::copy(&mut input, &mut encoder)?;
        encoder.finish()?.sync_all()
    });
    if let Err(e) = result {
        let _ = fs::remove_file(&dst);
        return Err(e);
    }
    fs::remove_file(src)
}

/// Largest tail searched for the last record of a file.
const LAST_RECORD_SCAN: u64 = 256 * 1024;

/// Time of the last decodable record of a JSON-lines file.
fn last_record_time(path: &Path) -> std::io::Result<Option<DateTime<Utc>>> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let start = size.saturating_sub(LAST_RECORD_SCAN);
    file.seek(SeekFrom::Start(start))?;
    let mut tail = Vec::with_capacity((size - start) as usize);
    file.read_to_end(&mut tail)?;

    Ok(tail
        .split(|&b| b == b'\n')
        .rev()
        .find_map(|line| jsonlog::decode(line).ok())
        .map(|msg| msg.timestamp))
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn rename_if_exists(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rudder_logger::Source;

    // Fixed sub-second digits keep every encoded record the same length.
    fn msg(text: &str) -> Message {
        let n: i64 = text.rsplit('-').next().and_then(|n| n.parse().ok()).unwrap_or(0);
        let at = Utc
            .timestamp_opt(1_714_557_600 + n, 123_456_789)
            .single()
            .expect("valid time");
        Message::new(Source::Stdout, at, text)
    }

    fn record_len(text: &str) -> u64 {
        jsonlog::encode(&msg(text)).expect("encode").len() as u64
    }

    #[test]
    fn generation_names() {
        let base = Path::new("/var/lib/rudder/c1/c1-json.log");
        assert_eq!(
            generation_path(base, 1, false),
            PathBuf::from("/var/lib/rudder/c1/c1-json.log.1")
        );
        assert_eq!(
            generation_path(base, 3, true),
            PathBuf::from("/var/lib/rudder/c1/c1-json.log.3.gz")
        );
    }

    #[tokio::test]
    async fn appends_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("c.log");
        let file = RotatingLogFile::open(&path, RotationConfig::default()).expect("open");

        file.write_message(&msg("one")).await.expect("write");
        file.write_message(&msg("two")).await.expect("write");
        file.close().await.expect("close");

        let contents = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"log\":\"one\\n\""));
        assert!(lines[1].contains("\"log\":\"two\\n\""));
    }

    #[tokio::test]
    async fn rotation_shifts_generations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.log");
        // Every record is the same size; two fit per file.
        let size = record_len("line-0") * 2;
        let file = RotatingLogFile::open(&path, RotationConfig::new(size, 3)).expect("open");

        for i in 0..8 {
            file.write_message(&msg(&format!("line-{i}"))).await.expect("write");
        }
        file.close().await.expect("close");

        let read = |p: PathBuf| std::fs::read_to_string(p).expect("read");
        assert!(read(path.clone()).contains("line-7"));
        assert!(read(path.clone()).contains("line-6"));
        assert!(read(generation_path(&path, 1, false)).contains("line-5"));
        assert!(read(generation_path(&path, 2, false)).contains("line-3"));
        assert!(!generation_path(&path, 3, false).exists());
    }

    #[tokio::test]
    async fn single_generation_truncates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.log");
        let size = record_len("line-0") * 2;
        let file = RotatingLogFile::open(&path, RotationConfig::new(size, 1)).expect("open");

        for i in 0..5 {
            file.write_message(&msg(&format!("line-{i}"))).await.expect("write");
        }
        file.close().await.expect("close");

        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("line-4"));
        assert!(!generation_path(&path, 1, false).exists());
    }

    #[tokio::test]
    async fn compressed_generation_carries_last_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.log");
        let size = record_len("line-0") * 2;
        let config = RotationConfig::new(size, 3).with_compress(true);
        let file = RotatingLogFile::open(&path, config).expect("open");

        let mut stamps = Vec::new();
        for i in 0..3 {
            let m = msg(&format!("line-{i}"));
            stamps.push(m.timestamp);
            file.write_message(&m).await.expect("write");
        }
        file.close().await.expect("close");

        let gz = generation_path(&path, 1, true);
        assert!(gz.exists());
        assert!(!generation_path(&path, 1, false).exists());
        let last = crate::tempfiles::last_timestamp(&gz).await.expect("header");
        assert_eq!(last, Some(stamps[1]));
    }

    fn gunzip(path: &Path) -> String {
        let mut out = String::new();
        flate2::read::GzDecoder::new(File::open(path).expect("open gz"))
            .read_to_string(&mut out)
            .expect("gunzip");
        out
    }

    fn leave_uncompressed_generation(path: &Path, texts: &[&str]) {
        let body: Vec<u8> = texts
            .iter()
            .flat_map(|t| jsonlog::encode(&msg(t)).expect("encode"))
            .collect();
        std::fs::write(generation_path(path, 1, false), body).expect("write leftover");
    }

    #[tokio::test]
    async fn rotation_compresses_a_leftover_generation_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.log");
        leave_uncompressed_generation(&path, &["old-0", "old-1"]);

        let size = record_len("line-0") * 2;
        let config = RotationConfig::new(size, 3).with_compress(true);
        let file = RotatingLogFile::open(&path, config).expect("open");
        for i in 0..3 {
            file.write_message(&msg(&format!("line-{i}"))).await.expect("write");
        }
        file.close().await.expect("close");

        assert!(!generation_path(&path, 1, false).exists());
        let older = generation_path(&path, 2, true);
        assert!(gunzip(&older).contains("old-1"));
        assert_eq!(
            crate::tempfiles::last_timestamp(&older).await.expect("header"),
            Some(msg("old-1").timestamp)
        );
        assert!(gunzip(&generation_path(&path, 1, true)).contains("line-1"));

        let file = RotatingLogFile::open(&path, config).expect("reopen");
        let lines: Vec<_> = file
            .read_logs(ReadConfig::all())
            .collect()
            .await
            .expect("read")
            .iter()
            .map(|m| m.line_lossy().into_owned())
            .collect();
        assert_eq!(lines, vec!["old-0", "old-1", "line-0", "line-1", "line-2"]);
        file.close().await.expect("close");
    }

    #[tokio::test]
    async fn rotation_waits_while_a_leftover_cannot_be_compressed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.log");
        leave_uncompressed_generation(&path, &["old-0", "old-1"]);
        // Compression cannot create its output over a directory.
        std::fs::create_dir(generation_path(&path, 1, true)).expect("mkdir");

        let size = record_len("line-0") * 2;
        let config = RotationConfig::new(size, 3).with_compress(true);
        let file = RotatingLogFile::open(&path, config).expect("open");
        for i in 0..3 {
            file.write_message(&msg(&format!("line-{i}"))).await.expect("write");
        }
        file.close().await.expect("close");

        let leftover = std::fs::read_to_string(generation_path(&path, 1, false)).expect("leftover kept");
        assert!(leftover.contains("old-0") && leftover.contains("old-1"));
        let current = std::fs::read_to_string(&path).expect("read");
        assert_eq!(current.lines().count(), 3);
    }

    #[tokio::test]
    async fn reopened_file_keeps_last_time_for_compression() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.log");
        let size = record_len("line-0") * 2;
        let config = RotationConfig::new(size, 3).with_compress(true);

        let file = RotatingLogFile::open(&path, config).expect("open");
        file.write_message(&msg("line-0")).await.expect("write");
        file.write_message(&msg("line-1")).await.expect("write");
        file.close().await.expect("close");

        // The first write after reopening rotates the earlier records.
        let file = RotatingLogFile::open(&path, config).expect("reopen");
        file.write_message(&msg("line-2")).await.expect("write");
        file.close().await.expect("close");

        let gz = generation_path(&path, 1, true);
        assert_eq!(
            crate::tempfiles::last_timestamp(&gz).await.expect("header"),
            Some(msg("line-1").timestamp)
        );
    }

    #[test]
    fn last_record_time_skips_an_unfinished_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.log");
        let mut body = jsonlog::encode(&msg("line-4")).expect("encode");
        body.extend_from_slice(b"{\"log\":\"cut");
        std::fs::write(&path, body).expect("write");

        assert_eq!(last_record_time(&path).expect("scan"), Some(msg("line-4").timestamp));
        std::fs::write(&path, b"").expect("truncate");
        assert_eq!(last_record_time(&path).expect("scan"), None);
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = RotatingLogFile::open(dir.path().join("c.log"), RotationConfig::default()).expect("open");
        file.close().await.expect("close");
        file.close().await.expect("second close");
        assert!(matches!(
            file.write_message(&msg("late")).await,
            Err(JsonFileError::Closed)
        ));
    }
}
