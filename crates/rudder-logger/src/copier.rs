//! Copies a container's raw output streams into a log sink.
//!
//! Each stream is read by its own task, split on newlines and stamped with
//! the capture time. Lines longer than the buffer are cut into partial
//! records that share an id, the last one flagged `last`.

use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::message::{Message, PartialLogMeta, Source};
use crate::traits::LogSink;

/// Longest line emitted as a single record.
pub const MAX_LINE_SIZE: usize = 16 * 1024;

const READ_SIZE: usize = 2 * 1024;

/// Counters for one finished copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    /// Records handed to the sink.
    pub records: u64,
    /// Records the sink rejected.
    pub errors: u64,
}

impl std::ops::Add for CopyStats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            records: self.records + rhs.records,
            errors: self.errors + rhs.errors,
        }
    }
}

/// Running copy of one or more output streams.
pub struct Copier {
    tasks: Vec<JoinHandle<CopyStats>>,
    cancel: CancellationToken,
}

impl Copier {
    /// Starts copying every source into `sink`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start<R>(sources: Vec<(Source, R)>, sink: Arc<dyn LogSink>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self::start_with_line_size(sources, sink, MAX_LINE_SIZE)
    }

    /// Starts copying with a custom maximum line size.
    pub fn start_with_line_size<R>(
        sources: Vec<(Source, R)>,
        sink: Arc<dyn LogSink>,
        max_line: usize,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let tasks = sources
            .into_iter()
            .map(|(source, reader)| {
                let mut stream = LineSplitter::new(source, Arc::clone(&sink), max_line.max(1));
                let cancel = cancel.clone();
                tokio::spawn(async move { stream.copy(reader, cancel).await })
            })
            .collect();

        Self { tasks, cancel }
    }

    /// Stops copying; streams are not read further.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Waits for every stream to reach EOF or cancellation.
    pub async fn wait(self) -> CopyStats {
        let mut total = CopyStats::default();
        for task in self.tasks {
            match task.await {
                Ok(stats) => total = total + stats,
                Err(e) => warn!(error = %e, "log copy task failed"),
            }
        }
        total
    }
}

struct LineSplitter {
    source: Source,
    sink: Arc<dyn LogSink>,
    max_line: usize,
    partial_id: Option<String>,
    ordinal: u32,
    stats: CopyStats,
}

impl LineSplitter {
    fn new(source: Source, sink: Arc<dyn LogSink>, max_line: usize) -> Self {
        Self {
            source,
            sink,
            max_line,
            partial_id: None,
            ordinal: 0,
            stats: CopyStats::default(),
        }
    }

    async fn copy<R: AsyncRead + Unpin>(&mut self, mut reader: R, cancel: CancellationToken) -> CopyStats {
        let mut buf: Vec<u8> = Vec::with_capacity(self.max_line);
        let mut chunk = vec![0u8; READ_SIZE];

        loop {
            let n = tokio::select! {
                () = cancel.cancelled() => break,
                read = reader.read(&mut chunk) => match read {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(source = %self.source, error = %e, "error reading log stream");
                        break;
                    }
                },
            };

            if n == 0 {
                if !buf.is_empty() {
                    let rest = std::mem::take(&mut buf);
                    self.emit(rest, true).await;
                }
                break;
            }

            buf.extend_from_slice(&chunk[..n]);

            loop {
                match buf.iter().position(|&b| b == b'\n') {
                    Some(pos) if pos <= self.max_line => {
                        let mut line: Vec<u8> = buf.drain(..=pos).collect();
                        line.pop();
                        self.emit(line, true).await;
                    }
                    _ if buf.len() >= self.max_line => {
                        let fragment: Vec<u8> = buf.drain(..self.max_line).collect();
                        self.emit(fragment, false).await;
                    }
                    _ => break,
                }
            }
        }

        debug!(source = %self.source, records = self.stats.records, "log copy finished");
        self.stats
    }

    /// Sends one record; `complete` is false for a fragment that continues.
    async fn emit(&mut self, line: Vec<u8>, complete: bool) {
        let mut msg = Message::new(self.source, Utc::now(), line);

        if !complete || self.partial_id.is_some() {
            let id = self
                .partial_id
                .get_or_insert_with(|| Uuid::new_v4().simple().to_string())
                .clone();
            self.ordinal += 1;
            msg.partial = Some(PartialLogMeta {
                id,
                ordinal: self.ordinal,
                last: complete,
            });
            if complete {
                self.partial_id = None;
                self.ordinal = 0;
            }
        }

        self.stats.records += 1;
        if let Err(e) = self.sink.log(msg).await {
            self.stats.errors += 1;
            warn!(source = %self.source, driver = %self.sink.name(), error = %e, "failed to log message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::testing::RecordingSink;

    #[tokio::test]
    async fn splits_lines_and_strips_newlines() {
        let recording = RecordingSink::shared();
        let input: &[u8] = b"first\nsecond\n\nlast without newline";
        let copier = Copier::start(vec![(Source::Stdout, input)], recording.clone());

        let stats = copier.wait().await;
        assert_eq!(stats.records, 4);
        assert_eq!(stats.errors, 0);
        assert_eq!(
            recording.lines(),
            vec!["first", "second", "", "last without newline"]
        );
        assert!(recording.messages.lock().iter().all(|m| m.partial.is_none()));
    }

    #[tokio::test]
    async fn long_lines_become_partial_records() {
        let recording = RecordingSink::shared();
        let input: &[u8] = b"abcdefghij\nok\n";
        let copier = Copier::start_with_line_size(vec![(Source::Stderr, input)], recording.clone(), 4);
        copier.wait().await;

        let messages = recording.messages.lock().clone();
        let lines: Vec<_> = messages.iter().map(|m| m.line_lossy().into_owned()).collect();
        assert_eq!(lines, vec!["abcd", "efgh", "ij", "ok"]);

        let partials: Vec<_> = messages[..3]
            .iter()
            .map(|m| m.partial.clone().expect("fragment"))
            .collect();
        assert!(partials.iter().all(|p| p.id == partials[0].id));
        assert_eq!(
            partials.iter().map(|p| (p.ordinal, p.last)).collect::<Vec<_>>(),
            vec![(1, false), (2, false), (3, true)]
        );
        assert!(messages[3].partial.is_none());
        assert!(messages.iter().all(|m| m.source == Source::Stderr));
    }

    #[tokio::test]
    async fn copies_both_streams() {
        let recording = RecordingSink::shared();
        let out: &[u8] = b"to stdout\n";
        let err: &[u8] = b"to stderr\n";
        let copier = Copier::start(
            vec![(Source::Stdout, out), (Source::Stderr, err)],
            recording.clone(),
        );
        let stats = copier.wait().await;
        assert_eq!(stats.records, 2);

        let messages = recording.messages.lock().clone();
        assert!(messages.iter().any(|m| m.source == Source::Stdout && m.line == b"to stdout"));
        assert!(messages.iter().any(|m| m.source == Source::Stderr && m.line == b"to stderr"));
    }

    #[tokio::test]
    async fn close_stops_an_open_stream() {
        let recording = RecordingSink::shared();
        let (_writer, reader) = tokio::io::duplex(64);
        let copier = Copier::start(vec![(Source::Stdout, reader)], recording.clone());

        copier.close();
        let stats = tokio::time::timeout(std::time::Duration::from_secs(1), copier.wait())
            .await
            .expect("copy stops after close");
        assert_eq!(stats.records, 0);
    }
}
