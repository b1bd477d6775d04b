//! Read sessions over a single CRI log file.
//!
//! A session delivers the file from its start (or the requested tail) and,
//! when following, waits for more output for as long as the container runs.
//! Waiting uses a file watcher plus a forced check every second. A change
//! that replaced the file (rename, removal, recreation) switches to the new
//! file by path after draining the old handle. A plain write only resumes
//! reading.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rudder_filewatch::{FileId, FileWatcher, Op, WatchError, file_id};
use rudder_logger::{
    DEFAULT_WATCHER_BUFFER, LogProducer, LogWatcher, Message, PartialLogMeta, Source, log_watcher,
    tail_offset,
};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::options::LogOptions;
use crate::parse::{CriLogLine, LogFormat};
use crate::runtime::{RuntimeService, is_container_running};

/// Longest a follower waits without a file event before checking anyway.
pub const FORCED_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Watch errors tolerated during one wait.
const WATCH_ERROR_RETRIES: u32 = 5;

const EOL: u8 = b'\n';

/// Starts a read session over the CRI log at `path`.
///
/// Records arrive on the returned watcher in file order. Failing to open,
/// seek or watch the file ends the session with an error; malformed lines
/// are skipped. Must be called within a Tokio runtime.
pub fn read_logs(
    path: impl Into<PathBuf>,
    container_id: impl Into<String>,
    opts: LogOptions,
    runtime: Arc<dyn RuntimeService>,
) -> LogWatcher {
    let (producer, watcher) = log_watcher(DEFAULT_WATCHER_BUFFER);
    let mut session = Session {
        path: path.into(),
        container_id: container_id.into(),
        remaining: opts.tail,
        opts,
        runtime,
        format: None,
        fragments: Fragments::default(),
    };

    tokio::spawn(async move {
        match session.run(&producer).await {
            Ok(()) => debug!(
                path = %session.path.display(),
                container_id = %session.container_id,
                "finished reading CRI log"
            ),
            Err(e) => {
                warn!(
                    path = %session.path.display(),
                    container_id = %session.container_id,
                    error = %e,
                    "CRI log read session failed"
                );
                producer.fail(e.into());
            }
        }
    });

    watcher
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    /// New data may have been appended.
    Changed,
    /// The file may have been replaced.
    Recreated,
    /// The container is not running; drain once more.
    NotRunning,
    /// The consumer went away.
    Stopped,
}

/// A file handle read one line at a time.
///
/// Bytes after the last newline stay buffered until the rest of the line
/// arrives.
struct LineReader {
    reader: BufReader<File>,
    pending: Vec<u8>,
    id: Option<FileId>,
}

impl LineReader {
    fn new(file: File, id: Option<FileId>) -> Self {
        Self {
            reader: BufReader::new(file),
            pending: Vec::new(),
            id,
        }
    }

    async fn open(path: &std::path::Path) -> std::io::Result<Self> {
        let file = File::open(path).await?;
        let id = file_id(&file.metadata().await?);
        Ok(Self::new(file, id))
    }

    /// Next complete line, newline included; `None` at the current end.
    async fn next_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        self.reader.read_until(EOL, &mut self.pending).await?;
        if self.pending.last() == Some(&EOL) {
            Ok(Some(std::mem::take(&mut self.pending)))
        } else {
            Ok(None)
        }
    }

    fn take_pending(&mut self) -> Option<Vec<u8>> {
        (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending))
    }
}

/// Assigns fragment ids to consecutive partial lines of each stream.
#[derive(Debug, Default)]
struct Fragments {
    stdout: Option<(String, u32)>,
    stderr: Option<(String, u32)>,
}

impl Fragments {
    fn message(&mut self, line: &CriLogLine) -> Message {
        let mut msg = Message::new(line.stream, line.timestamp, line.text().to_vec());
        let slot = match line.stream {
            Source::Stdout => &mut self.stdout,
            Source::Stderr => &mut self.stderr,
        };

        let partial = line.is_partial();
        if partial || slot.is_some() {
            let (id, ordinal) =
                slot.get_or_insert_with(|| (Uuid::new_v4().simple().to_string(), 0));
            *ordinal += 1;
            msg.partial = Some(PartialLogMeta {
                id: id.clone(),
                ordinal: *ordinal,
                last: !partial,
            });
            if !partial {
                *slot = None;
            }
        }
        msg
    }
}

struct Session {
    path: PathBuf,
    container_id: String,
    opts: LogOptions,
    runtime: Arc<dyn RuntimeService>,
    remaining: i64,
    format: Option<LogFormat>,
    fragments: Fragments,
}

impl Session {
    async fn run(&mut self, producer: &LogProducer) -> Result<()> {
        let mut file = File::open(&self.path).await?;
        let meta = file.metadata().await?;
        let start = match usize::try_from(self.opts.tail) {
            Ok(n) => tail_offset(&mut file, meta.len(), n).await?.offset,
            Err(_) => 0,
        };
        file.seek(SeekFrom::Start(start)).await?;
        let mut reader = LineReader::new(file, file_id(&meta));

        let mut watcher = None;
        let result = self.read_loop(&mut reader, &mut watcher, producer).await;
        if let Some(mut watcher) = watcher {
            watcher.close().await;
        }
        result
    }

    async fn read_loop(
        &mut self,
        reader: &mut LineReader,
        watcher: &mut Option<Box<dyn FileWatcher>>,
        producer: &LogProducer,
    ) -> Result<()> {
        let mut running = true;

        loop {
            if self.opts.is_limited() && self.remaining <= 0 {
                return Ok(());
            }

            if let Some(line) = reader.next_line().await? {
                if self.deliver(&line, producer).await == Flow::Stop {
                    return Ok(());
                }
                continue;
            }

            if !self.opts.follow {
                if let Some(rest) = reader.take_pending() {
                    warn!(path = %self.path.display(), "incomplete line at end of log file");
                    self.deliver(&rest, producer).await;
                }
                return Ok(());
            }

            // Exited container: this was the final drain.
            if !running {
                return Ok(());
            }

            if watcher.is_none() {
                *watcher = Some(rudder_filewatch::watch_file(&self.path)?);
                // Output written before the watch was armed has no event.
                continue;
            }
            let Some(w) = watcher.as_deref_mut() else {
                continue;
            };

            match self.wait_logs(w, producer).await? {
                Wait::Stopped => return Ok(()),
                Wait::NotRunning => running = false,
                wait @ (Wait::Changed | Wait::Recreated) => {
                    if !self.replaced(reader, wait == Wait::Recreated).await? {
                        continue;
                    }
                    let Some(next) = self.reopen().await? else {
                        debug!(path = %self.path.display(), "log file not recreated yet");
                        continue;
                    };
                    if self.drain(reader, producer).await == Flow::Stop {
                        return Ok(());
                    }
                    *reader = next;

                    if let Err(e) = w.remove(&self.path) {
                        debug!(path = %self.path.display(), error = %e, "failed to remove stale watch");
                    }
                    w.add(&self.path)?;
                    debug!(path = %self.path.display(), "switched to recreated log file");
                }
            }
        }
    }

    /// Delivers what is left of a replaced file.
    async fn drain(&mut self, reader: &mut LineReader, producer: &LogProducer) -> Flow {
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    if self.deliver(&line, producer).await == Flow::Stop {
                        return Flow::Stop;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "failed to drain replaced log file");
                    return Flow::Continue;
                }
            }
        }
        match reader.take_pending() {
            Some(rest) => self.deliver(&rest, producer).await,
            None => Flow::Continue,
        }
    }

    async fn wait_logs(&self, watcher: &mut dyn FileWatcher, producer: &LogProducer) -> Result<Wait> {
        if !is_container_running(self.runtime.as_ref(), &self.container_id).await? {
            return Ok(Wait::NotRunning);
        }

        let mut retries = WATCH_ERROR_RETRIES;
        let forced = tokio::time::sleep(FORCED_CHECK_INTERVAL);
        tokio::pin!(forced);

        loop {
            let channels = watcher.channels();
            tokio::select! {
                () = producer.consumer_gone() => return Ok(Wait::Stopped),
                event = channels.events.recv() => {
                    let Some(event) = event else {
                        return Err(WatchError::Closed.into());
                    };
                    return Ok(match event.op {
                        Op::Write | Op::Chmod => Wait::Changed,
                        Op::Create | Op::Remove | Op::Rename => Wait::Recreated,
                    });
                }
                err = channels.errors.recv() => {
                    let Some(e) = err else {
                        return Err(WatchError::Closed.into());
                    };
                    warn!(path = %self.path.display(), error = %e, retries, "file watch error");
                    if retries == 0 {
                        return Err(e.into());
                    }
                    retries -= 1;
                }
                () = &mut forced => return Ok(Wait::Changed),
            }
        }
    }

    /// Whether the path no longer names the file behind `reader`.
    async fn replaced(&self, reader: &LineReader, hint: bool) -> Result<bool> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => match (reader.id, file_id(&meta)) {
                (Some(old), Some(new)) => Ok(old != new),
                _ => Ok(hint),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    async fn reopen(&self) -> Result<Option<LineReader>> {
        match LineReader::open(&self.path).await {
            Ok(reader) => Ok(Some(reader)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn deliver(&mut self, raw: &[u8], producer: &LogProducer) -> Flow {
        let format = match self.format {
            Some(format) => format,
            None => match LogFormat::detect(raw) {
                Ok(format) => *self.format.insert(format),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "skipping log line of unknown format");
                    return Flow::Continue;
                }
            },
        };

        let line = match format.parse(raw) {
            Ok(line) => line,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "skipping malformed log line");
                return Flow::Continue;
            }
        };
        if self.opts.is_before_since(line.timestamp) {
            return Flow::Continue;
        }

        let msg = self.fragments.message(&line);
        if !producer.send(msg).await {
            return Flow::Stop;
        }
        self.remaining -= 1;
        Flow::Continue
    }
}
