//! The streaming shipping client.
//!
//! [`StreamLogClient::log`] only ever waits for room in a bounded queue. A
//! single sender task owns the queue's receiving end and writes one frame
//! per record to the aggregator connection. A failed write keeps the record
//! for retry and starts a reconnect sequence. The reconnect gate lets only
//! one sequence run at a time, whatever the number of failing callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::SinkExt;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{DEFAULT_MAX_FRAME, FrameCodec};
use crate::discovery::{AddressPool, DISCOVERY_REFRESH_INTERVAL, DiscoveryClient, spawn_refresh};
use crate::error::{Result, StreamLogError};
use crate::state::{AtomicConnectionState, ConnectionState};

/// Default capacity of the cache queue.
pub const DEFAULT_CACHE_SIZE: usize = 2000;

/// Idle time after which a keepalive frame is sent.
pub const IDLE_PING_INTERVAL: Duration = Duration::from_secs(3);

/// Delay between reconnect attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Payload of the keepalive frame.
pub const PING: &str = "ping";

const ENQUEUE_RETRY: Duration = Duration::from_millis(100);
const SEND_RETRY_DELAY: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest a single frame write may take before the connection is dropped.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest `close` spends writing records still queued.
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

type Connection = FramedWrite<TcpStream, FrameCodec>;

/// Settings of a shipping client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Fixed aggregator address (`host:port`); tried before discovery.
    pub server: Option<String>,
    /// Discovery endpoint url.
    pub discovery_url: Option<String>,
    /// Capacity of the cache queue, in records.
    pub cache_size: usize,
    /// Idle time before a keepalive.
    pub idle_ping: Duration,
    /// Delay between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Background discovery refresh period.
    pub discovery_refresh: Duration,
    /// Timeout of one TCP connect.
    pub connect_timeout: Duration,
    /// Timeout of one frame write; a peer that stops reading is dropped.
    pub write_timeout: Duration,
    /// Largest frame payload.
    pub max_frame: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: None,
            discovery_url: None,
            cache_size: DEFAULT_CACHE_SIZE,
            idle_ping: IDLE_PING_INTERVAL,
            reconnect_interval: RECONNECT_INTERVAL,
            discovery_refresh: DISCOVERY_REFRESH_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl ClientConfig {
    /// Sets the fixed aggregator address.
    #[must_use]
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    /// Sets the discovery endpoint.
    #[must_use]
    pub fn with_discovery_url(mut self, url: impl Into<String>) -> Self {
        self.discovery_url = Some(url.into());
        self
    }

    /// Sets the cache queue capacity.
    #[must_use]
    pub const fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Sets the keepalive idle time.
    #[must_use]
    pub const fn with_idle_ping(mut self, interval: Duration) -> Self {
        self.idle_ping = interval;
        self
    }

    /// Sets the delay between reconnect attempts.
    #[must_use]
    pub const fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Sets the discovery refresh period.
    #[must_use]
    pub const fn with_discovery_refresh(mut self, interval: Duration) -> Self {
        self.discovery_refresh = interval;
        self
    }

    /// Sets the deadline of one frame write.
    #[must_use]
    pub const fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

struct Inner {
    config: ClientConfig,
    state: AtomicConnectionState,
    conn: tokio::sync::Mutex<Option<Connection>>,
    address: Mutex<Option<String>>,
    pool: Arc<AddressPool>,
    discovery: Option<DiscoveryClient>,
    gate: Arc<Semaphore>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    reconnects: AtomicU64,
    sent: AtomicU64,
    last_stamp: AtomicI64,
    cancel: CancellationToken,
}

/// Ships records to a remote aggregator over a framed TCP stream.
pub struct StreamLogClient {
    inner: Arc<Inner>,
    queue: mpsc::Sender<String>,
    sender: Mutex<Option<JoinHandle<()>>>,
    refresh: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StreamLogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLogClient")
            .field("address", &self.address())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl StreamLogClient {
    /// Starts the sender task and the first connection attempt.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`StreamLogError::NoAddress`] if neither a server nor a
    /// discovery url is configured.
    pub fn start(config: ClientConfig) -> Result<Self> {
        let discovery = config
            .discovery_url
            .as_deref()
            .map(DiscoveryClient::new)
            .transpose()?;
        if config.server.is_none() && discovery.is_none() {
            return Err(StreamLogError::NoAddress);
        }

        let (queue, rx) = mpsc::channel(config.cache_size.max(1));
        let inner = Arc::new(Inner {
            address: Mutex::new(config.server.clone()),
            state: AtomicConnectionState::new(ConnectionState::Disconnected),
            conn: tokio::sync::Mutex::new(None),
            pool: Arc::new(AddressPool::new()),
            discovery,
            gate: Arc::new(Semaphore::new(1)),
            reconnect_task: Mutex::new(None),
            reconnects: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            last_stamp: AtomicI64::new(0),
            cancel: CancellationToken::new(),
            config,
        });

        let refresh = inner.discovery.clone().map(|client| {
            spawn_refresh(
                client,
                Arc::clone(&inner.pool),
                inner.config.discovery_refresh,
                inner.cancel.child_token(),
            )
        });
        inner.trigger_reconnect();
        let sender = tokio::spawn(run_sender(Arc::clone(&inner), rx));

        debug!(
            server = ?inner.config.server,
            discovery = ?inner.config.discovery_url,
            cache_size = inner.config.cache_size,
            "log shipping client started"
        );
        Ok(Self {
            inner,
            queue,
            sender: Mutex::new(Some(sender)),
            refresh: Mutex::new(refresh),
        })
    }

    /// Queues one payload for delivery.
    ///
    /// Waits while the queue is full; a payload is never dropped.
    ///
    /// # Errors
    ///
    /// Returns [`StreamLogError::Closed`] once the client is closed.
    pub async fn log(&self, payload: String) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(StreamLogError::Closed);
        }

        let mut waited = false;
        loop {
            tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => return Err(StreamLogError::Closed),
                reserved = tokio::time::timeout(ENQUEUE_RETRY, self.queue.reserve()) => match reserved {
                    Ok(Ok(permit)) => {
                        permit.send(payload);
                        return Ok(());
                    }
                    Ok(Err(_)) => return Err(StreamLogError::Closed),
                    Err(_) => {
                        if !waited {
                            warn!(
                                cache_size = self.inner.config.cache_size,
                                state = %self.state(),
                                "log cache full, waiting for the sender"
                            );
                            waited = true;
                        }
                    }
                },
            }
        }
    }

    /// Nanoseconds since the epoch, strictly increasing across calls.
    pub fn next_stamp(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let prev = self
            .inner
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev.saturating_add(1)))
            })
            .unwrap_or_else(|prev| prev);
        now.max(prev.saturating_add(1))
    }

    /// Starts a reconnect sequence unless one is already running.
    ///
    /// Returns whether this call started it.
    pub fn reconnect(&self) -> bool {
        self.inner.trigger_reconnect()
    }

    /// Number of reconnect sequences started so far.
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    /// Records written to a connection so far, keepalives excluded.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.inner.sent.load(Ordering::SeqCst)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.load()
    }

    /// Address of the current or last aggregator.
    #[must_use]
    pub fn address(&self) -> Option<String> {
        self.inner.address.lock().clone()
    }

    /// Stops the client.
    ///
    /// Waits for the sender and any reconnect sequence to finish before the
    /// connection is shut down. Records still queued are written if the
    /// connection is up; later calls to [`log`](Self::log) fail.
    pub async fn close(&self) {
        self.inner.cancel.cancel();

        let sender = self.sender.lock().take();
        if let Some(handle) = sender {
            if let Err(e) = handle.await {
                warn!(error = %e, "log sender task failed");
            }
        }

        let reconnect = self.inner.reconnect_task.lock().take();
        let refresh = self.refresh.lock().take();
        for handle in [reconnect, refresh].into_iter().flatten() {
            if let Err(e) = handle.await {
                warn!(error = %e, "log shipping task failed");
            }
        }

        let conn = self.inner.conn.lock().await.take();
        if let Some(mut conn) = conn {
            let shutdown = SinkExt::<&str>::close(&mut conn);
            match tokio::time::timeout(self.inner.config.write_timeout, shutdown).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "error closing aggregator connection"),
                Err(_) => debug!("aggregator connection did not drain before close"),
            }
        }

        if self.inner.state.load() != ConnectionState::Closed {
            self.inner.state.store(ConnectionState::Closed);
            info!(sent = self.sent(), reconnects = self.reconnects(), "log shipping client closed");
        }
    }
}

impl Drop for StreamLogClient {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    fn trigger_reconnect(self: &Arc<Self>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let Ok(permit) = Arc::clone(&self.gate).try_acquire_owned() else {
            return false;
        };

        let seq = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.store(ConnectionState::Reconnecting);
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            inner.reconnect_loop(seq).await;
            drop(permit);
        });
        *self.reconnect_task.lock() = Some(handle);
        true
    }

    async fn reconnect_loop(&self, seq: u64) {
        let mut attempt = 0u32;
        while !self.cancel.is_cancelled() {
            attempt += 1;

            let last = self.address.lock().clone();
            if let Some(address) = &last {
                if self.try_connect(address).await {
                    info!(seq, attempt, address = %address, "connected to log aggregator");
                    return;
                }
            }

            let discovered = tokio::select! {
                () = self.cancel.cancelled() => return,
                address = self.discover() => address,
            };
            if let Some(address) = discovered.filter(|a| last.as_ref() != Some(a)) {
                if self.try_connect(&address).await {
                    info!(seq, attempt, address = %address, previous = ?last, "switched log aggregator");
                    *self.address.lock() = Some(address);
                    return;
                }
            }

            warn!(
                seq,
                attempt,
                retry_in = ?self.config.reconnect_interval,
                "could not reach a log aggregator"
            );
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
    }

    async fn discover(&self) -> Option<String> {
        if let Some(discovery) = &self.discovery {
            if let Err(e) = discovery.refresh(&self.pool).await {
                debug!(url = %discovery.url(), error = %e, "discovery refresh failed");
            }
        }
        self.pool.pick().or_else(|| self.config.server.clone())
    }

    async fn try_connect(&self, address: &str) -> bool {
        let connect = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address));
        let stream = tokio::select! {
            () = self.cancel.cancelled() => return false,
            result = connect => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!(address, error = %e, "connect to log aggregator failed");
                    return false;
                }
                Err(_) => {
                    debug!(address, "connect to log aggregator timed out");
                    return false;
                }
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(address, error = %e, "failed to set TCP_NODELAY");
        }

        let mut conn = self.conn.lock().await;
        if self.cancel.is_cancelled() {
            return false;
        }
        *conn = Some(FramedWrite::new(stream, FrameCodec::new(self.config.max_frame)));
        self.state.store(ConnectionState::Connected);
        true
    }

    async fn send(&self, payload: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let Some(framed) = conn.as_mut() else {
            return Err(StreamLogError::NotConnected);
        };
        let err = match tokio::time::timeout(self.config.write_timeout, framed.send(payload)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => StreamLogError::WriteTimeout(self.config.write_timeout),
        };
        *conn = None;
        self.state.store(ConnectionState::Disconnected);
        warn!(error = %err, "lost connection to log aggregator");
        Err(err)
    }

    /// Drops the connection, discarding anything half written to it.
    async fn disconnect(&self) {
        if self.conn.lock().await.take().is_some() {
            self.state.store(ConnectionState::Disconnected);
        }
    }
}

async fn run_sender(inner: Arc<Inner>, mut rx: mpsc::Receiver<String>) {
    let mut retry: Option<String> = None;

    loop {
        let payload = match retry.take() {
            Some(payload) => payload,
            None => tokio::select! {
                () = inner.cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(payload) => payload,
                    None => break,
                },
                () = tokio::time::sleep(inner.config.idle_ping) => {
                    if inner.send(PING).await.is_err() {
                        inner.trigger_reconnect();
                    }
                    continue;
                }
            },
        };

        let outcome = {
            let send = inner.send(&payload);
            tokio::pin!(send);
            tokio::select! {
                result = &mut send => Some(result),
                // A write in progress gets the flush budget to finish.
                () = inner.cancel.cancelled() => {
                    tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut send).await.ok()
                }
            }
        };
        let Some(result) = outcome else {
            // The frame may sit half written in the connection buffer.
            inner.disconnect().await;
            retry = Some(payload);
            break;
        };

        match result {
            Ok(()) => {
                inner.sent.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                debug!(error = %e, "send failed, keeping record for retry");
                retry = Some(payload);
                inner.trigger_reconnect();
                tokio::select! {
                    () = inner.cancel.cancelled() => break,
                    () = tokio::time::sleep(SEND_RETRY_DELAY) => {}
                }
            }
        }
    }

    // Nothing is accepted past this point; flush what made it in.
    rx.close();
    let deadline = tokio::time::Instant::now() + CLOSE_FLUSH_TIMEOUT;
    let mut flushed = 0u64;
    let mut unsent = 0u64;
    loop {
        let payload = match retry.take() {
            Some(payload) => payload,
            // Returns None only once every reserved slot has been sent or released.
            None => match rx.recv().await {
                Some(payload) => payload,
                None => break,
            },
        };
        if unsent > 0 {
            unsent += 1;
            continue;
        }
        match tokio::time::timeout_at(deadline, inner.send(&payload)).await {
            Ok(Ok(())) => flushed += 1,
            Ok(Err(_)) => unsent += 1,
            Err(_) => {
                inner.disconnect().await;
                unsent += 1;
            }
        }
    }
    inner.sent.fetch_add(flushed, Ordering::SeqCst);
    if unsent > 0 {
        warn!(unsent, "log records left unsent at close");
    }
    debug!(flushed, "log sender stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable() -> ClientConfig {
        // Port 1 on loopback refuses connections.
        ClientConfig::default()
            .with_server("127.0.0.1:1")
            .with_reconnect_interval(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn requires_an_address_source() {
        assert!(matches!(
            StreamLogClient::start(ClientConfig::default()),
            Err(StreamLogError::NoAddress)
        ));
    }

    #[tokio::test]
    async fn only_one_reconnect_runs_at_a_time() {
        let client = Arc::new(StreamLogClient::start(unreachable()).expect("start"));
        assert_eq!(client.reconnects(), 1);

        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let client = Arc::clone(&client);
                tokio::spawn(async move { client.reconnect() })
            })
            .collect();
        for attempt in attempts {
            assert!(!attempt.await.expect("join"), "a second reconnect started");
        }
        assert_eq!(client.reconnects(), 1);
        assert_eq!(client.state(), ConnectionState::Reconnecting);

        tokio::time::timeout(Duration::from_secs(2), client.close())
            .await
            .expect("close interrupts the reconnect wait");
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(!client.reconnect());
    }

    #[tokio::test]
    async fn log_fails_after_close() {
        let client = StreamLogClient::start(unreachable()).expect("start");
        client.log("queued".to_string()).await.expect("log");
        client.close().await;
        assert!(matches!(
            client.log("late".to_string()).await,
            Err(StreamLogError::Closed)
        ));
    }

    #[tokio::test]
    async fn full_queue_waits_until_close() {
        let client = Arc::new(
            StreamLogClient::start(unreachable().with_cache_size(1)).expect("start"),
        );
        // One record sits in the sender's retry slot, one in the queue.
        client.log("a".to_string()).await.expect("log");
        client.log("b".to_string()).await.expect("log");

        let blocked = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.log("c".to_string()).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!blocked.is_finished(), "log returned while the queue was full");

        client.close().await;
        let result = blocked.await.expect("join");
        assert!(matches!(result, Err(StreamLogError::Closed)));
    }

    #[tokio::test]
    async fn stamps_strictly_increase() {
        let client = StreamLogClient::start(unreachable()).expect("start");
        let stamps: Vec<i64> = (0..1000).map(|_| client.next_stamp()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
        client.close().await;
    }

    #[test]
    fn config_builders() {
        let config = ClientConfig::default()
            .with_server("a:1")
            .with_discovery_url("http://d")
            .with_cache_size(10)
            .with_idle_ping(Duration::from_secs(1))
            .with_discovery_refresh(Duration::from_secs(2))
            .with_write_timeout(Duration::from_millis(250));
        assert_eq!(config.server.as_deref(), Some("a:1"));
        assert_eq!(config.write_timeout, Duration::from_millis(250));
        assert_eq!(ClientConfig::default().write_timeout, WRITE_TIMEOUT);
        assert_eq!(config.discovery_url.as_deref(), Some("http://d"));
        assert_eq!(config.cache_size, 10);
        assert_eq!(config.idle_ping, Duration::from_secs(1));
        assert_eq!(config.discovery_refresh, Duration::from_secs(2));
        assert_eq!(config.reconnect_interval, RECONNECT_INTERVAL);
        assert_eq!(ClientConfig::default().cache_size, DEFAULT_CACHE_SIZE);
    }
}
