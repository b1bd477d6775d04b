//! Non-blocking delivery through a bounded in-memory ring.
//!
//! [`RingBufferSink`] accepts records without ever waiting on the driver it
//! wraps. Records are queued up to a byte budget of line data; once the
//! budget is spent, new records are dropped and counted until the drain task
//! catches up.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{LoggerError, Result};
use crate::message::Message;
use crate::traits::{LogReader, LogSink};

struct RingState {
    queue: VecDeque<Message>,
    size_bytes: u64,
    closed: bool,
}

struct MessageRing {
    state: Mutex<RingState>,
    wake: Notify,
    max_bytes: u64,
    dropped: AtomicU64,
}

impl MessageRing {
    fn new(max_bytes: u64) -> Self {
        Self {
            state: Mutex::new(RingState {
                queue: VecDeque::new(),
                size_bytes: 0,
                closed: false,
            }),
            wake: Notify::new(),
            max_bytes,
            dropped: AtomicU64::new(0),
        }
    }

    fn enqueue(&self, msg: Message) -> Result<()> {
        let size = msg.line.len() as u64;
        let mut state = self.state.lock();
        if state.closed {
            return Err(LoggerError::Closed);
        }

        if state.size_bytes + size > self.max_bytes && !state.queue.is_empty() {
            drop(state);
            self.wake.notify_one();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(dropped, max_bytes = self.max_bytes, "log ring full, dropping messages");
            }
            return Ok(());
        }

        state.size_bytes += size;
        state.queue.push_back(msg);
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Option<Message> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(msg) = state.queue.pop_front() {
                    state.size_bytes -= msg.line.len() as u64;
                    return Some(msg);
                }
                if state.closed {
                    return None;
                }
            }
            self.wake.notified().await;
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.wake.notify_one();
    }
}

/// Wraps a sink so that logging never blocks the producer.
pub struct RingBufferSink {
    inner: Arc<dyn LogSink>,
    ring: Arc<MessageRing>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl RingBufferSink {
    /// Wraps `inner`, buffering up to `max_bytes` of line data.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(inner: Arc<dyn LogSink>, max_bytes: u64) -> Self {
        let ring = Arc::new(MessageRing::new(max_bytes));
        let drain = tokio::spawn(drain_ring(Arc::clone(&ring), Arc::clone(&inner)));
        Self {
            inner,
            ring,
            drain: Mutex::new(Some(drain)),
        }
    }

    /// Number of records dropped because the ring was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }

    async fn shutdown(&self) -> Result<()> {
        self.ring.close();
        let drain = self.drain.lock().take();
        if let Some(handle) = drain {
            if let Err(e) = handle.await {
                warn!(error = %e, "log ring drain task failed");
            }
        }
        self.inner.close().await
    }
}

async fn drain_ring(ring: Arc<MessageRing>, inner: Arc<dyn LogSink>) {
    while let Some(msg) = ring.dequeue().await {
        if let Err(e) = inner.log(msg).await {
            debug!(driver = %inner.name(), error = %e, "ring drain failed to deliver message");
        }
    }
}

impl LogSink for RingBufferSink {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn log(&self, msg: Message) -> BoxFuture<'_, Result<()>> {
        let result = self.ring.enqueue(msg);
        async move { result }.boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        self.shutdown().boxed()
    }

    fn reader(&self) -> Option<&dyn LogReader> {
        self.inner.reader()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Source;
    use crate::traits::testing::RecordingSink;
    use chrono::Utc;
    use std::time::Duration;

    fn msg(text: &str) -> Message {
        Message::new(Source::Stdout, Utc::now(), text)
    }

    #[tokio::test]
    async fn drains_everything_on_close() {
        let recording = RecordingSink::shared();
        let ring = RingBufferSink::new(recording.clone(), 1024 * 1024);

        for i in 0..100 {
            ring.log(msg(&format!("line {i}"))).await.expect("log");
        }
        ring.close().await.expect("close");

        let lines = recording.lines();
        assert_eq!(lines.len(), 100);
        assert_eq!(lines[0], "line 0");
        assert_eq!(lines[99], "line 99");
        assert!(recording.closed.load(Ordering::SeqCst));
        assert_eq!(ring.dropped(), 0);
    }

    #[tokio::test]
    async fn drops_when_full_instead_of_blocking() {
        let recording = RecordingSink::slow(Duration::from_millis(50));
        let ring = RingBufferSink::new(recording.clone(), 10);

        let started = std::time::Instant::now();
        for _ in 0..50 {
            ring.log(msg("0123456789")).await.expect("log");
        }
        assert!(started.elapsed() < Duration::from_millis(50 * 10));
        assert!(ring.dropped() > 0);

        ring.close().await.expect("close");
        let delivered = recording.lines().len() as u64;
        assert_eq!(delivered + ring.dropped(), 50);
    }

    #[tokio::test]
    async fn log_after_close_fails() {
        let ring = RingBufferSink::new(RecordingSink::shared(), 1024);
        ring.close().await.expect("close");
        assert!(matches!(ring.log(msg("late")).await, Err(LoggerError::Closed)));
    }

    #[tokio::test]
    async fn oversized_message_accepted_into_empty_ring() {
        let recording = RecordingSink::shared();
        let ring = RingBufferSink::new(recording.clone(), 4);
        ring.log(msg("much longer than four bytes")).await.expect("log");
        ring.close().await.expect("close");
        assert_eq!(recording.lines().len(), 1);
    }
}
