//! Capability traits implemented by log drivers.
//!
//! Every driver is a [`LogSink`]; drivers that keep logs locally are also a
//! [`LogReader`] and can answer tail/follow queries.

use futures::future::BoxFuture;

use crate::error::Result;
use crate::message::{Message, ReadConfig};
use crate::watcher::LogWatcher;

/// Destination for captured log records.
///
/// One instance exists per container; `close` is called exactly once when
/// the container's logging is torn down.
pub trait LogSink: Send + Sync {
    /// Name of the driver backing this sink.
    fn name(&self) -> &str;

    /// Accepts one record.
    ///
    /// Implementations may wait for buffer space but must never wait on
    /// network or disk latency of earlier records directly.
    fn log(&self, msg: Message) -> BoxFuture<'_, Result<()>>;

    /// Flushes and releases the sink.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    /// Returns the read capability, if this driver keeps logs locally.
    fn reader(&self) -> Option<&dyn LogReader> {
        None
    }
}

/// Sinks that can replay what they stored.
pub trait LogReader: Send + Sync {
    /// Starts a read session.
    ///
    /// Records and the terminal error are delivered through the returned
    /// watcher; dropping it ends the session.
    fn read_logs(&self, config: ReadConfig) -> LogWatcher;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures::FutureExt;
    use parking_lot::Mutex;

    use super::*;

    /// Sink that records everything it is given.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) messages: Mutex<Vec<Message>>,
        pub(crate) closed: AtomicBool,
        pub(crate) delay: Option<std::time::Duration>,
    }

    impl RecordingSink {
        pub(crate) fn shared() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn slow(delay: std::time::Duration) -> Arc<Self> {
            Arc::new(Self {
                delay: Some(delay),
                ..Self::default()
            })
        }

        pub(crate) fn lines(&self) -> Vec<String> {
            self.messages
                .lock()
                .iter()
                .map(|m| m.line_lossy().into_owned())
                .collect()
        }
    }

    impl LogSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        fn log(&self, msg: Message) -> BoxFuture<'_, Result<()>> {
            async move {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                self.messages.lock().push(msg);
                Ok(())
            }
            .boxed()
        }

        fn close(&self) -> BoxFuture<'_, Result<()>> {
            self.closed.store(true, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use crate::message::Source;
    use chrono::Utc;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn sink_usable_as_trait_object() {
        let recording = RecordingSink::shared();
        let sink: Arc<dyn LogSink> = recording.clone();

        sink.log(Message::new(Source::Stdout, Utc::now(), "hello"))
            .await
            .expect("log");
        sink.close().await.expect("close");

        assert_eq!(sink.name(), "recording");
        assert!(sink.reader().is_none());
        assert_eq!(recording.lines(), vec!["hello"]);
        assert!(recording.closed.load(Ordering::SeqCst));
    }
}
