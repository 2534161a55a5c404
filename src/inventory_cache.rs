use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::future::Shared;
use futures::FutureExt;
use governor::DefaultDirectRateLimiter;
use governor::Quota;
use governor::RateLimiter;
use reqwest::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::config::InventoryConfig;
use crate::error::Error;
use crate::error::InventoryError;
use crate::error::Result;

/// Read-only access to the compute inventory
#[async_trait]
pub trait InventoryClient: Send + Sync {
    /// Private DNS name attached to the instance
    async fn private_dns_name(&self, instance_id: &str)
        -> std::result::Result<String, InventoryError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceRecord {
    #[serde(default)]
    private_dns_name: Option<String>,
}

/// Inventory client for an HTTP lookup service answering
/// `GET {endpoint}/instances/{id}` with `{"privateDnsName": "..."}`
#[derive(Debug, Clone)]
pub struct HttpInventoryClient {
    client: Client,
    endpoint: String,
}

impl HttpInventoryClient {
    pub fn new(endpoint: impl Into<String>, client: Client) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl InventoryClient for HttpInventoryClient {
    async fn private_dns_name(
        &self,
        instance_id: &str,
    ) -> std::result::Result<String, InventoryError> {
        let url = format!("{}/instances/{instance_id}", self.endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| InventoryError::Upstream(format!("failed to query inventory: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(InventoryError::NotFound(instance_id.to_string())),
            status if !status.is_success() => {
                return Err(InventoryError::Upstream(format!(
                    "inventory returned status {status}"
                )))
            }
            _ => {}
        }

        let record: InstanceRecord = response
            .json()
            .await
            .map_err(|e| InventoryError::Upstream(format!("invalid inventory response: {e}")))?;

        record
            .private_dns_name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| InventoryError::NotFound(instance_id.to_string()))
    }
}

struct CachedEntry {
    value: String,
    fetched_at: Instant,
}

impl CachedEntry {
    fn new(value: String) -> Self {
        Self {
            value,
            fetched_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() >= ttl
    }
}

type SharedLookup = Shared<BoxFuture<'static, std::result::Result<String, InventoryError>>>;

struct Inner {
    entries: RwLock<HashMap<String, CachedEntry>>,
    in_flight: Mutex<HashMap<String, SharedLookup>>,
    limiter: DefaultDirectRateLimiter,
    client: Arc<dyn InventoryClient>,
    ttl: Duration,
    max_wait: Duration,
}

/// Rate-limited TTL cache in front of the inventory.
///
/// Concurrent misses for one key share a single upstream query.
#[derive(Clone)]
pub struct InventoryCache {
    inner: Arc<Inner>,
}

impl InventoryCache {
    /// Create a cache allowing `qps` steady queries per second with bursts of `burst`
    pub fn new(
        client: Arc<dyn InventoryClient>,
        qps: u32,
        burst: u32,
        ttl: Duration,
        max_wait: Duration,
    ) -> Result<Self> {
        let qps = NonZeroU32::new(qps).ok_or_else(|| Error::config("inventory qps must be positive"))?;
        let burst =
            NonZeroU32::new(burst).ok_or_else(|| Error::config("inventory burst must be positive"))?;

        Ok(Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                limiter: RateLimiter::direct(Quota::per_second(qps).allow_burst(burst)),
                client,
                ttl,
                max_wait,
            }),
        })
    }

    pub fn from_config(client: Arc<dyn InventoryClient>, config: &InventoryConfig) -> Result<Self> {
        Self::new(
            client,
            config.qps,
            config.burst,
            config.cache_ttl,
            config.max_wait,
        )
    }

    /// Get the value for `key`, querying the inventory on a miss
    pub async fn get_tag(&self, key: &str) -> std::result::Result<String, InventoryError> {
        if let Some(value) = self.try_get_cached(key).await {
            return Ok(value);
        }

        let lookup = {
            let mut in_flight = self.inner.in_flight.lock().await;
            // A lookup may have finished between the first check and taking the lock.
            if let Some(value) = self.try_get_cached(key).await {
                return Ok(value);
            }
            match in_flight.get(key) {
                Some(lookup) => lookup.clone(),
                None => {
                    let lookup = Inner::fetch(Arc::clone(&self.inner), key.to_string())
                        .boxed()
                        .shared();
                    in_flight.insert(key.to_string(), lookup.clone());
                    lookup
                }
            }
        };

        lookup.await
    }

    /// Try to get a value from the cache if present and not expired
    async fn try_get_cached(&self, key: &str) -> Option<String> {
        {
            let entries = self.inner.entries.read().await;
            let cached = entries.get(key)?;
            if !cached.is_expired(self.inner.ttl) {
                return Some(cached.value.clone());
            }
        }

        let mut entries = self.inner.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_expired(self.inner.ttl)) {
            entries.remove(key);
        }
        None
    }

    /// Drop every expired entry, returning how many were removed
    pub async fn evict_expired(&self) -> usize {
        let mut entries = self.inner.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(self.inner.ttl));
        before - entries.len()
    }

    /// Number of cached entries, expired or not
    pub async fn len(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Evict expired entries every `interval` until cancelled
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Inventory cache sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let evicted = cache.evict_expired().await;
                        if evicted > 0 {
                            debug!(evicted, "Evicted expired inventory entries");
                        }
                    }
                }
            }
        });
    }
}

impl Inner {
    async fn fetch(inner: Arc<Inner>, key: String) -> std::result::Result<String, InventoryError> {
        let result = inner.query(&key).await;

        if let Ok(value) = &result {
            let mut entries = inner.entries.write().await;
            entries.insert(key.clone(), CachedEntry::new(value.clone()));
        }
        inner.in_flight.lock().await.remove(&key);

        result
    }

    async fn query(&self, key: &str) -> std::result::Result<String, InventoryError> {
        if tokio::time::timeout(self.max_wait, self.limiter.until_ready())
            .await
            .is_err()
        {
            warn!(key, "Inventory rate limit wait exceeded");
            return Err(InventoryError::Upstream(
                "rate limit wait exceeded".to_string(),
            ));
        }

        debug!(key, "Querying inventory");
        self.client.private_dns_name(key).await
    }
}
