//! Renders records to a client's stdout and stderr.

use chrono::SecondsFormat;
use rudder_logger::{LogWatcher, Message, Source};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::options::LogOptions;

/// Writes every record from `watcher` to the writer of its stream.
///
/// Complete records get their newline back. With `opts.timestamp`, each new
/// line (not the continuation of a fragment) is prefixed with its
/// RFC 3339 timestamp. Once `opts.bytes` bytes have been written the last
/// record is cut short and the session is closed. Returns the number of
/// bytes written.
pub async fn write_logs<O, E>(
    mut watcher: LogWatcher,
    opts: &LogOptions,
    stdout: &mut O,
    stderr: &mut E,
) -> Result<u64>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut writer = LogWriter::new(stdout, stderr, opts);
    if writer.remain == Some(0) {
        watcher.close();
        return Ok(0);
    }

    while let Some(next) = watcher.recv().await {
        if writer.write(&next?).await? == Written::LimitReached {
            watcher.close();
            break;
        }
    }

    writer.flush().await?;
    Ok(writer.written)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Written {
    More,
    LimitReached,
}

struct LogWriter<'a, O, E> {
    stdout: &'a mut O,
    stderr: &'a mut E,
    opts: &'a LogOptions,
    remain: Option<u64>,
    new_line: bool,
    written: u64,
}

impl<'a, O, E> LogWriter<'a, O, E>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    fn new(stdout: &'a mut O, stderr: &'a mut E, opts: &'a LogOptions) -> Self {
        Self {
            stdout,
            stderr,
            opts,
            remain: u64::try_from(opts.bytes).ok(),
            new_line: true,
            written: 0,
        }
    }

    async fn write(&mut self, msg: &Message) -> std::io::Result<Written> {
        if self.opts.is_before_since(msg.timestamp) {
            return Ok(Written::More);
        }

        let mut line = Vec::with_capacity(msg.line.len() + 32);
        if self.opts.timestamp && self.new_line {
            line.extend_from_slice(
                msg.timestamp
                    .to_rfc3339_opts(SecondsFormat::Nanos, true)
                    .as_bytes(),
            );
            line.push(b' ');
        }
        line.extend_from_slice(&msg.line);
        if !msg.is_partial() {
            line.push(b'\n');
        }
        self.new_line = !msg.is_partial();

        let mut status = Written::More;
        if let Some(remain) = self.remain.as_mut() {
            let len = line.len() as u64;
            if len >= *remain {
                line.truncate(usize::try_from(*remain).unwrap_or(usize::MAX));
                status = Written::LimitReached;
            }
            *remain -= line.len() as u64;
        }

        match msg.source {
            Source::Stdout => self.stdout.write_all(&line).await?,
            Source::Stderr => self.stderr.write_all(&line).await?,
        }
        self.written += line.len() as u64;
        Ok(status)
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.stdout.flush().await?;
        self.stderr.flush().await
    }
}
