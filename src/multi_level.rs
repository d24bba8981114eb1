//! Multi-Level Cache - L1/L2 Coordinator
//!
//! Composes one in-process L1 and one shared L2:
//!
//! ```text
//! get:    L1 ──hit──> return
//!          └─miss──> L2 ──hit──> backfill L1 (short TTL) ──> return
//!                     └─miss──> None
//! set:    L2 first (source of truth) ──ok──> L1 ──> publish "{node_id}:{key}"
//! listen: "{other}:{key}" ──> delete key from L1 only
//! ```
//!
//! Any tier error is a miss for that tier only; it never aborts the request.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::invalidation::{DEFAULT_CHANNEL, InvalidationListener, InvalidationMessage};
use crate::stats::{AtomicMultiLevelStats, CacheStatsSnapshot, MultiLevelStats, bump};
use crate::traits::{CacheBackend, L2CacheBackend};

/// Per-key coalescing slot: the winner leaves its computed value here
type KeySlot = Arc<Mutex<Option<Value>>>;

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct MultiLevelConfig {
    /// Copy L2 hits into L1
    pub sync_l1: bool,
    /// TTL of backfilled L1 copies, independent of the original TTL
    pub l1_backfill_ttl: Duration,
    /// Pub/sub channel carrying invalidation messages
    pub channel: String,
    /// Identity of this instance; defaults to a random UUID
    pub node_id: String,
    /// TTL for writes that do not specify one
    pub default_ttl: Option<Duration>,
}

impl Default for MultiLevelConfig {
    fn default() -> Self {
        Self {
            sync_l1: true,
            l1_backfill_ttl: Duration::from_secs(60),
            channel: DEFAULT_CHANNEL.to_string(),
            node_id: uuid::Uuid::new_v4().to_string(),
            default_ttl: None,
        }
    }
}

/// Tier that served a read
#[derive(Debug, Clone, Copy)]
enum Tier {
    L1,
    L2,
}

/// RAII removal of a coalescing slot once its winner is done
///
/// Only removes the map entry if it still points at the same slot, so a
/// `delete` followed by a fresh slot for the same key is left alone.
struct SlotGuard<'a> {
    slots: &'a DashMap<String, KeySlot>,
    key: &'a str,
    slot: &'a KeySlot,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slots
            .remove_if(self.key, |_, current| Arc::ptr_eq(current, self.slot));
    }
}

/// Two-tier cache coordinator
///
/// # Example
///
/// ```rust,no_run
/// use multi_level_cache::{MultiLevelCache, MultiLevelConfig};
/// # async fn example(l1: std::sync::Arc<dyn multi_level_cache::CacheBackend>,
/// #                  l2: std::sync::Arc<dyn multi_level_cache::L2CacheBackend>) -> anyhow::Result<()> {
/// let cache = MultiLevelCache::new(l1, l2, MultiLevelConfig::default()).await;
///
/// let user = cache
///     .get_or_set("user:1", || async { Ok(serde_json::json!({"name": "alice"})) }, None)
///     .await?;
///
/// cache.close().await;
/// # Ok(())
/// # }
/// ```
pub struct MultiLevelCache {
    l1: Arc<dyn CacheBackend>,
    l2: Arc<dyn L2CacheBackend>,
    config: MultiLevelConfig,
    stats: Arc<AtomicMultiLevelStats>,
    /// In-flight `get_or_set` computations, one slot per key
    slots: DashMap<String, KeySlot>,
    listener: SyncMutex<Option<InvalidationListener>>,
}

impl MultiLevelCache {
    /// Create the coordinator and, if L2 supports pub/sub, start listening
    ///
    /// The subscription is established before this returns, so writes made by
    /// peers afterwards are observed.
    pub async fn new(
        l1: Arc<dyn CacheBackend>,
        l2: Arc<dyn L2CacheBackend>,
        config: MultiLevelConfig,
    ) -> Self {
        info!(
            node_id = %config.node_id,
            l1 = l1.name(),
            l2 = l2.name(),
            channel = %config.channel,
            "Initializing Multi-Level Cache"
        );

        let stats = Arc::new(AtomicMultiLevelStats::default());
        let listener = Self::start_listener(&l1, &l2, &config, &stats).await;

        Self {
            l1,
            l2,
            config,
            stats,
            slots: DashMap::new(),
            listener: SyncMutex::new(listener),
        }
    }

    async fn start_listener(
        l1: &Arc<dyn CacheBackend>,
        l2: &Arc<dyn L2CacheBackend>,
        config: &MultiLevelConfig,
        stats: &Arc<AtomicMultiLevelStats>,
    ) -> Option<InvalidationListener> {
        let stream = match l2.subscribe(&config.channel).await {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                warn!(channel = %config.channel, "L2 has no pub/sub, cross-instance invalidation disabled");
                return None;
            }
            Err(e) => {
                warn!(channel = %config.channel, error = %e, "Subscribe failed, cross-instance invalidation disabled");
                return None;
            }
        };

        let l1 = Arc::clone(l1);
        let stats = Arc::clone(stats);
        let node_id: Arc<str> = Arc::from(config.node_id.as_str());

        let handler = move |payload: String| {
            let l1 = Arc::clone(&l1);
            let stats = Arc::clone(&stats);
            let node_id = Arc::clone(&node_id);
            async move { Self::apply_invalidation(&*l1, &stats, &node_id, &payload).await }
        };

        info!(channel = %config.channel, node_id = %config.node_id, "Subscribed to invalidation channel");
        Some(InvalidationListener::start(
            Arc::clone(l2),
            config.channel.clone(),
            stream,
            handler,
        ))
    }

    /// Handle one invalidation payload received from the channel
    async fn apply_invalidation(
        l1: &dyn CacheBackend,
        stats: &AtomicMultiLevelStats,
        node_id: &str,
        payload: &str,
    ) -> Result<()> {
        bump(&stats.invalidations_received);

        let Some(message) = InvalidationMessage::parse(payload) else {
            bump(&stats.invalidations_ignored);
            anyhow::bail!("malformed invalidation payload {payload:?}");
        };

        if message.node_id == node_id {
            bump(&stats.invalidations_ignored);
            return Ok(());
        }

        match l1.delete(&message.key).await {
            Ok(_) => {
                bump(&stats.invalidations_applied);
                debug!(key = %message.key, from = %message.node_id, "[L1] Invalidated by peer");
                Ok(())
            }
            Err(e) => {
                bump(&stats.listener_errors);
                Err(e.context(format!("failed to invalidate '{}' in L1", message.key)))
            }
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    #[must_use]
    pub fn config(&self) -> &MultiLevelConfig {
        &self.config
    }

    #[must_use]
    pub fn l1(&self) -> &Arc<dyn CacheBackend> {
        &self.l1
    }

    #[must_use]
    pub fn l2(&self) -> &Arc<dyn L2CacheBackend> {
        &self.l2
    }

    /// Whether the invalidation listener task is alive
    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(InvalidationListener::is_running)
    }

    /// Comprehensive statistics snapshot
    pub fn get_stats(&self) -> MultiLevelStats {
        self.stats.snapshot(self.slots.len())
    }

    /// Stop the invalidation listener and wait for it to exit
    pub async fn close(&self) {
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.shutdown().await;
            info!(node_id = %self.config.node_id, "Multi-Level Cache closed");
        }
    }

    async fn publish_invalidation(&self, key: &str) {
        let payload = InvalidationMessage::new(self.config.node_id.as_str(), key).encode();
        match self.l2.publish(&self.config.channel, &payload).await {
            Ok(true) => bump(&self.stats.invalidations_published),
            Ok(false) => warn!(key = %key, "Invalidation not published, L2 unavailable"),
            Err(e) => warn!(key = %key, error = %e, "Invalidation publish failed"),
        }
    }

    async fn l1_get(&self, key: &str) -> Option<Value> {
        self.l1.get(key).await.unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "[L1] get failed, treating as miss");
            None
        })
    }

    async fn l2_get(&self, key: &str) -> Option<Value> {
        self.l2.get(key).await.unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "[L2] get failed, treating as miss");
            None
        })
    }

    /// Read L1 then L2, backfilling L1 on an L2 hit; touches no request counters
    async fn read_through(&self, key: &str) -> Option<(Value, Tier)> {
        if let Some(value) = self.l1_get(key).await {
            return Some((value, Tier::L1));
        }

        let value = self.l2_get(key).await?;
        if self.config.sync_l1 {
            match self
                .l1
                .set(key, value.clone(), Some(self.config.l1_backfill_ttl))
                .await
            {
                Ok(true) => {
                    bump(&self.stats.backfills);
                    debug!(key = %key, "Backfilled L1 from L2");
                }
                Ok(false) => {}
                Err(e) => warn!(key = %key, error = %e, "[L1] backfill failed"),
            }
        }
        Some((value, Tier::L2))
    }

    fn record_hit(&self, tier: Tier) {
        match tier {
            Tier::L1 => bump(&self.stats.l1_hits),
            Tier::L2 => bump(&self.stats.l2_hits),
        }
    }

    async fn lookup(&self, key: &str) -> Option<Value> {
        bump(&self.stats.total_requests);
        match self.read_through(key).await {
            Some((value, tier)) => {
                self.record_hit(tier);
                Some(value)
            }
            None => {
                bump(&self.stats.misses);
                None
            }
        }
    }

    /// Get a value, computing and storing it on a miss
    ///
    /// At most one `factory` runs per key at a time across all concurrent
    /// callers of this instance; the others wait and receive the same value.
    /// Each call counts as one request with exactly one outcome: an L1 hit, an
    /// L2 hit, a coalesced wait, or a miss that ran the factory.
    ///
    /// # Errors
    ///
    /// Returns the factory's error when this caller ran the factory and it failed.
    pub async fn get_or_set<F, Fut>(&self, key: &str, factory: F, ttl: Option<Duration>) -> Result<Value>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Value>> + Send,
    {
        bump(&self.stats.total_requests);
        if let Some((value, tier)) = self.read_through(key).await {
            self.record_hit(tier);
            return Ok(value);
        }

        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let mut computed = slot.lock().await;
        let _cleanup = SlotGuard {
            slots: &self.slots,
            key,
            slot: &slot,
        };

        if let Some(value) = computed.as_ref() {
            bump(&self.stats.coalesced);
            return Ok(value.clone());
        }

        // Double-check: a previous winner may have stored it before our slot existed
        if let Some((value, tier)) = self.read_through(key).await {
            self.record_hit(tier);
            return Ok(value);
        }

        bump(&self.stats.misses);
        debug!(key = %key, "Computing value (stampede protected)");
        let value = factory().await?;

        if !CacheBackend::set(self, key, value.clone(), ttl).await? {
            warn!(key = %key, "Computed value not cached, L2 write failed");
        }

        *computed = Some(value.clone());
        Ok(value)
    }

    /// Typed variant of [`get_or_set`](Self::get_or_set)
    ///
    /// Cached data that does not deserialize into `T` is dropped and recomputed.
    ///
    /// # Errors
    ///
    /// Returns the factory's error, or [`CacheError::Serialization`] when `T`
    /// does not round-trip through JSON.
    pub async fn get_or_set_typed<T, F, Fut>(&self, key: &str, factory: F, ttl: Option<Duration>) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        if let Some((value, tier)) = self.read_through(key).await {
            match serde_json::from_value::<T>(value) {
                Ok(typed) => {
                    bump(&self.stats.total_requests);
                    self.record_hit(tier);
                    return Ok(typed);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, type_name = std::any::type_name::<T>(), "Cached value has wrong shape, recomputing");
                    CacheBackend::delete(self, key).await?;
                }
            }
        }

        let value = self
            .get_or_set(
                key,
                || async move {
                    let typed = factory().await?;
                    Ok::<_, anyhow::Error>(serde_json::to_value(typed).map_err(CacheError::from)?)
                },
                ttl,
            )
            .await?;

        Ok(serde_json::from_value(value).map_err(CacheError::from)?)
    }
}

#[async_trait]
impl CacheBackend for MultiLevelCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lookup(key).await)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let ttl = ttl.or(self.config.default_ttl);

        let l2_ok = self.l2.set(key, value.clone(), ttl).await.unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "[L2] set failed");
            false
        });
        if !l2_ok {
            warn!(key = %key, "Write rejected, L2 unavailable");
            return Ok(false);
        }

        if let Err(e) = self.l1.set(key, value, ttl).await {
            warn!(key = %key, error = %e, "[L1] set failed after L2 write");
        }
        bump(&self.stats.sets);
        self.publish_invalidation(key).await;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let l1_removed = self.l1.delete(key).await.unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "[L1] delete failed");
            false
        });
        let l2_removed = self.l2.delete(key).await.unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "[L2] delete failed");
            false
        });
        self.slots.remove(key);

        if l1_removed || l2_removed {
            bump(&self.stats.deletes);
            self.publish_invalidation(key).await;
            return Ok(true);
        }
        Ok(false)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.l1.exists(key).await.unwrap_or(false) {
            return Ok(true);
        }
        Ok(self.l2.exists(key).await.unwrap_or(false))
    }

    /// Clears both tiers without notifying peers; their L1 copies age out by TTL
    async fn clear(&self) -> Result<bool> {
        let l1_ok = self.l1.clear().await.unwrap_or(false);
        let l2_ok = self.l2.clear().await.unwrap_or(false);
        info!(l1_ok, l2_ok, "Cleared both tiers");
        Ok(l1_ok && l2_ok)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys: HashSet<String> = self.l2.scan_keys(pattern).await?.into_iter().collect();
        keys.extend(self.l1.scan_keys(pattern).await?);
        Ok(keys.into_iter().collect())
    }

    async fn health_check(&self) -> bool {
        self.l1.health_check().await
    }

    fn name(&self) -> &'static str {
        "MultiLevel"
    }

    fn stats(&self) -> CacheStatsSnapshot {
        let stats = self.get_stats();
        CacheStatsSnapshot {
            hits: stats.l1_hits + stats.l2_hits,
            misses: stats.misses,
            evictions: self.l1.stats().evictions,
            sets: stats.sets,
            deletes: stats.deletes,
            errors: stats.listener_errors,
        }
    }
}

impl Drop for MultiLevelCache {
    fn drop(&mut self) {
        // Dropping the listener aborts its task
        if self.listener.get_mut().take().is_some() {
            debug!(node_id = %self.config.node_id, "Multi-Level Cache dropped without close()");
        }
    }
}
