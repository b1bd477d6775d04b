//! Channels connecting a read session to its consumer.
//!
//! A reader task owns the [`LogProducer`] half and pushes records in file
//! order; the API side owns the [`LogWatcher`] half. Errors are terminal:
//! a producer reports at most one, after its last record.

use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::LoggerError;
use crate::message::Message;

/// Default number of records buffered between producer and consumer.
pub const DEFAULT_WATCHER_BUFFER: usize = 4096;

/// Creates a connected producer/watcher pair.
#[must_use]
pub fn log_watcher(buffer: usize) -> (LogProducer, LogWatcher) {
    let (msg_tx, msg_rx) = mpsc::channel(buffer.max(1));
    let (err_tx, err_rx) = mpsc::channel(1);
    let consumer_gone = CancellationToken::new();

    (
        LogProducer {
            messages: msg_tx,
            errors: err_tx,
            consumer_gone: consumer_gone.clone(),
        },
        LogWatcher {
            messages: msg_rx,
            errors: err_rx,
            consumer_gone,
        },
    )
}

/// Consumer side of a read session.
#[derive(Debug)]
pub struct LogWatcher {
    messages: mpsc::Receiver<Message>,
    errors: mpsc::Receiver<LoggerError>,
    consumer_gone: CancellationToken,
}

impl LogWatcher {
    /// Receives the next record.
    ///
    /// Returns `None` once the session has ended; a session that ended on a
    /// failure yields that failure exactly once before `None`.
    pub async fn recv(&mut self) -> Option<Result<Message, LoggerError>> {
        match self.messages.recv().await {
            Some(msg) => Some(Ok(msg)),
            None => self.errors.try_recv().ok().map(Err),
        }
    }

    /// Drains the session into a vector, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<Message>, LoggerError> {
        let mut out = Vec::new();
        while let Some(next) = self.recv().await {
            out.push(next?);
        }
        Ok(out)
    }

    /// Tells the producer to stop; buffered records are discarded.
    pub fn close(&self) {
        self.consumer_gone.cancel();
    }
}

impl Drop for LogWatcher {
    fn drop(&mut self) {
        self.consumer_gone.cancel();
    }
}

/// Producer side of a read session.
#[derive(Debug, Clone)]
pub struct LogProducer {
    messages: mpsc::Sender<Message>,
    errors: mpsc::Sender<LoggerError>,
    consumer_gone: CancellationToken,
}

impl LogProducer {
    /// Delivers a record, waiting for buffer space.
    ///
    /// Returns false if the consumer has gone away.
    pub async fn send(&self, msg: Message) -> bool {
        if self.consumer_gone.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            () = self.consumer_gone.cancelled() => false,
            sent = self.messages.send(msg) => sent.is_ok(),
        }
    }

    /// Reports the terminal error of the session.
    pub fn fail(self, err: LoggerError) {
        if self.consumer_gone.is_cancelled() {
            return;
        }
        if self.errors.try_send(err).is_err() {
            tracing::debug!("read session error dropped, one already pending");
        }
    }

    /// Returns true if the consumer closed its side.
    #[must_use]
    pub fn is_consumer_gone(&self) -> bool {
        self.consumer_gone.is_cancelled() || self.messages.is_closed()
    }

    /// Completes when the consumer closes its side.
    pub fn consumer_gone(&self) -> WaitForCancellationFuture<'_> {
        self.consumer_gone.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Source;
    use chrono::Utc;

    fn line(text: &str) -> Message {
        Message::new(Source::Stdout, Utc::now(), text)
    }

    #[tokio::test]
    async fn records_arrive_in_order_then_end() {
        let (producer, watcher) = log_watcher(8);
        tokio::spawn(async move {
            for i in 0..5 {
                assert!(producer.send(line(&format!("line {i}"))).await);
            }
        });

        let got = watcher.collect().await.expect("no error");
        let lines: Vec<_> = got.iter().map(|m| m.line_lossy().into_owned()).collect();
        assert_eq!(lines, vec!["line 0", "line 1", "line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn error_is_reported_after_records() {
        let (producer, mut watcher) = log_watcher(8);
        assert!(producer.send(line("before")).await);
        producer.fail(LoggerError::Decode("broken".to_string()));

        let first = watcher.recv().await.expect("record");
        assert!(first.is_ok());
        let second = watcher.recv().await.expect("error");
        assert!(matches!(second, Err(LoggerError::Decode(_))));
        assert!(watcher.recv().await.is_none());
    }

    #[tokio::test]
    async fn closing_watcher_unblocks_producer() {
        let (producer, watcher) = log_watcher(1);
        assert!(producer.send(line("fills buffer")).await);

        let blocked = tokio::spawn({
            let producer = producer.clone();
            async move { producer.send(line("waits")).await }
        });
        watcher.close();

        assert!(!blocked.await.expect("join"));
        assert!(producer.is_consumer_gone());
    }
}
