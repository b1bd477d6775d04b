//! Aggregator discovery and the weighted address pool.
//!
//! The discovery endpoint answers a plain GET with
//!
//! ```json
//! {"list": [{"name": "agg-0", "url": "http://10.0.0.5:6362", "weight": 2}], "msg": "ok"}
//! ```
//!
//! Each `url` names an aggregator; the client connects to its host and port
//! over TCP.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, StreamLogError};

/// Port assumed when a discovered url has none.
pub const DEFAULT_STREAM_PORT: u16 = 6362;

/// How often the pool is refreshed in the background.
pub const DISCOVERY_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// One aggregator candidate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Endpoint {
    /// Instance name.
    #[serde(default)]
    pub name: String,
    /// Address, usually `http://host:port`.
    pub url: String,
    /// Relative selection weight.
    #[serde(default)]
    pub weight: u32,
}

/// Body of a discovery response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DiscoveryResponse {
    /// Candidates.
    #[serde(default)]
    pub list: Vec<Endpoint>,
    /// Status text.
    #[serde(default)]
    pub msg: String,
}

/// Turns a discovered url into a `host:port` TCP address.
///
/// The scheme and any path are dropped; a missing port becomes
/// [`DEFAULT_STREAM_PORT`]. Returns `None` for an empty host.
#[must_use]
pub fn stream_address(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    let host_port = rest.split('/').next().unwrap_or_default();
    if host_port.is_empty() {
        return None;
    }

    let has_port = host_port
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if has_port {
        Some(host_port.to_string())
    } else {
        Some(format!("{host_port}:{DEFAULT_STREAM_PORT}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    address: String,
    weight: u32,
}

/// Last known set of aggregator addresses.
#[derive(Debug, Default)]
pub struct AddressPool {
    candidates: RwLock<Vec<Candidate>>,
}

impl AddressPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the pool with the usable entries of `list`.
    ///
    /// Returns the number of addresses kept.
    pub fn replace(&self, list: &[Endpoint]) -> usize {
        let candidates: Vec<Candidate> = list
            .iter()
            .filter_map(|endpoint| {
                let address = stream_address(&endpoint.url)?;
                Some(Candidate {
                    address,
                    weight: endpoint.weight.max(1),
                })
            })
            .collect();
        let kept = candidates.len();
        *self.candidates.write() = candidates;
        kept
    }

    /// Whether the pool has no addresses.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.read().is_empty()
    }

    /// Every address in the pool.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.candidates
            .read()
            .iter()
            .map(|c| c.address.clone())
            .collect()
    }

    /// Picks an address with probability proportional to its weight.
    #[must_use]
    pub fn pick(&self) -> Option<String> {
        self.pick_with(&mut rand::thread_rng())
    }

    /// Like [`pick`](Self::pick) with a caller-supplied generator.
    pub fn pick_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<String> {
        self.candidates
            .read()
            .choose_weighted(rng, |c| c.weight)
            .ok()
            .map(|c| c.address.clone())
    }
}

/// HTTP client of the discovery endpoint.
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    http: reqwest::Client,
    url: String,
}

impl DiscoveryClient {
    /// Creates a client for the endpoint at `url`.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(DISCOVERY_TIMEOUT).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    /// The endpoint url.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetches the current candidate list.
    pub async fn fetch(&self) -> Result<DiscoveryResponse> {
        let response = self.http.get(&self.url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    /// Fetches the candidates and stores them in `pool`.
    ///
    /// An empty answer leaves the pool unchanged and is an error.
    pub async fn refresh(&self, pool: &AddressPool) -> Result<usize> {
        let response = self.fetch().await?;
        if response.list.is_empty() {
            let reason = if response.msg.is_empty() {
                "no aggregators listed".to_string()
            } else {
                response.msg
            };
            return Err(StreamLogError::Discovery(reason));
        }
        Ok(pool.replace(&response.list))
    }
}

/// Refreshes `pool` every `interval` until `cancel` fires.
pub fn spawn_refresh(
    client: DiscoveryClient,
    pool: Arc<AddressPool>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => match client.refresh(&pool).await {
                    Ok(count) => debug!(url = %client.url(), count, "refreshed aggregator addresses"),
                    Err(e) => warn!(url = %client.url(), error = %e, "aggregator discovery failed"),
                },
            }
        }
    })
}
