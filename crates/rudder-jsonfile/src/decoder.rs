//! Incremental decoding of JSON-lines files.
//!
//! The decoder keeps bytes that do not yet end in a newline, so a reader
//! positioned in the middle of a write picks the record up once the rest of
//! it arrives instead of failing on half a line.

use rudder_logger::Message;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

use crate::jsonlog;

const READ_CHUNK: usize = 8 * 1024;

/// Reads records from a JSON-lines stream.
#[derive(Debug)]
pub struct LineDecoder<R> {
    reader: R,
    buf: Vec<u8>,
    offset: u64,
    skipped: u64,
}

impl<R: AsyncRead + Unpin> LineDecoder<R> {
    /// Wraps a reader positioned at byte `offset` of its file.
    pub fn new(reader: R, offset: u64) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            offset,
            skipped: 0,
        }
    }

    /// Returns the next record, or `None` at the current end of input.
    ///
    /// Malformed complete lines are skipped with a warning. An unterminated
    /// trailing line stays buffered; see [`has_pending`](Self::has_pending).
    pub async fn next(&mut self) -> std::io::Result<Option<Message>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let start = self.offset;
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                self.offset += line.len() as u64;

                let body = &line[..pos];
                if body.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match jsonlog::decode(body) {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(e) => {
                        self.skipped += 1;
                        warn!(offset = start, error = %e, "skipping malformed log record");
                    }
                }
                continue;
            }

            self.buf.reserve(READ_CHUNK);
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Returns true if an unterminated line is buffered.
    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Offset of the first byte not yet returned as part of a record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset of the underlying reader: consumed plus buffered bytes.
    pub fn position(&self) -> u64 {
        self.offset + self.buf.len() as u64
    }

    /// Number of malformed lines skipped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Drops the buffered partial line, returning its length.
    pub fn discard_pending(&mut self) -> usize {
        let n = self.buf.len();
        self.buf.clear();
        self.offset += n as u64;
        n
    }

    /// Restarts decoding at `offset`, dropping any buffered bytes.
    ///
    /// The caller must have positioned the reader at `offset`.
    pub fn restart_at(&mut self, offset: u64) {
        self.buf.clear();
        self.offset = offset;
    }

    /// Mutable access to the underlying reader.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Swaps the underlying reader, keeping buffered bytes and the offset.
    pub fn with_reader<S>(self, reader: S) -> LineDecoder<S> {
        self.map_reader(|_| reader)
    }

    /// Transforms the underlying reader, keeping buffered bytes and the
    /// offset.
    pub fn map_reader<S>(self, f: impl FnOnce(R) -> S) -> LineDecoder<S> {
        LineDecoder {
            reader: f(self.reader),
            buf: self.buf,
            offset: self.offset,
            skipped: self.skipped,
        }
    }

    /// Returns the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = r#"{"log":"a\n","stream":"stdout","time":"2024-05-01T10:00:00Z"}"#;
    const B: &str = r#"{"log":"b\n","stream":"stderr","time":"2024-05-01T10:00:01Z"}"#;

    #[tokio::test]
    async fn decodes_records_in_order() {
        let input = format!("{A}\n{B}\n");
        let mut decoder = LineDecoder::new(input.as_bytes(), 0);

        assert_eq!(decoder.next().await.expect("read").expect("a").line, b"a");
        assert_eq!(decoder.next().await.expect("read").expect("b").line, b"b");
        assert!(decoder.next().await.expect("read").is_none());
        assert!(!decoder.has_pending());
        assert_eq!(decoder.offset(), input.len() as u64);
    }

    #[tokio::test]
    async fn skips_malformed_lines() {
        let input = format!("{A}\ngarbage\n\n{B}\n");
        let mut decoder = LineDecoder::new(input.as_bytes(), 0);

        assert_eq!(decoder.next().await.expect("read").expect("a").line, b"a");
        assert_eq!(decoder.next().await.expect("read").expect("b").line, b"b");
        assert_eq!(decoder.skipped(), 1);
    }

    #[tokio::test]
    async fn keeps_unterminated_tail_until_completed() {
        let (first, rest) = B.split_at(20);
        let head = format!("{A}\n{first}");
        let mut decoder = LineDecoder::new(head.as_bytes(), 100);

        assert!(decoder.next().await.expect("read").is_some());
        assert!(decoder.next().await.expect("read").is_none());
        assert!(decoder.has_pending());
        assert_eq!(decoder.offset(), 100 + A.len() as u64 + 1);
        assert_eq!(decoder.position(), 100 + head.len() as u64);

        let tail = format!("{rest}\n");
        let mut decoder = decoder.with_reader(tail.as_bytes());
        assert_eq!(decoder.next().await.expect("read").expect("b").line, b"b");
        assert!(!decoder.has_pending());
    }

    #[tokio::test]
    async fn discard_and_restart() {
        let input = format!("{A}\n{{\"log\":");
        let mut decoder = LineDecoder::new(input.as_bytes(), 0);
        decoder.next().await.expect("read");
        assert!(decoder.next().await.expect("read").is_none());
        assert_eq!(decoder.discard_pending(), 7);
        assert_eq!(decoder.offset(), input.len() as u64);

        decoder.restart_at(0);
        assert_eq!(decoder.offset(), 0);
        assert!(!decoder.has_pending());
    }
}
