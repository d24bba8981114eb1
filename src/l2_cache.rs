//! L2 Cache - Shared Remote Tier
//!
//! Wraps a [`RemoteStore`] and routes every call through a [`CircuitBreaker`].
//! A dead remote degrades performance, not availability: short-circuited and
//! failed calls come back as misses or `false`, never as errors.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backends::compile_pattern;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitBreakerSnapshot};
use crate::error::{CacheError, CacheResult};
use crate::stats::{AtomicCacheStats, CacheStatsSnapshot};
use crate::traits::{CacheBackend, L2CacheBackend, MessageStream, RemoteStore};

/// Configuration for `L2Cache`
#[derive(Debug, Clone, Copy)]
pub struct L2CacheConfig {
    /// TTL used when `set` is called without one
    pub default_ttl: Duration,
    /// Random fraction (0.0..=1.0) of the TTL added to every write
    pub ttl_jitter: f64,
}

impl Default for L2CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            ttl_jitter: 0.0,
        }
    }
}

/// Circuit-breaker guarded remote cache tier
pub struct L2Cache {
    store: Arc<dyn RemoteStore>,
    breaker: Arc<CircuitBreaker>,
    config: L2CacheConfig,
    stats: AtomicCacheStats,
}

impl L2Cache {
    /// Create the L2 tier over `store`
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidConfig` if `ttl_jitter` is outside `0.0..=1.0`.
    pub fn new(
        store: Arc<dyn RemoteStore>,
        breaker: Arc<CircuitBreaker>,
        config: L2CacheConfig,
    ) -> CacheResult<Self> {
        if !(0.0..=1.0).contains(&config.ttl_jitter) {
            return Err(CacheError::InvalidConfig(format!(
                "ttl_jitter must be within 0.0..=1.0, got {}",
                config.ttl_jitter
            )));
        }

        info!(
            store = %store.identity(),
            breaker = %breaker.name(),
            ttl_jitter = config.ttl_jitter,
            "Initializing L2 Cache"
        );

        Ok(Self {
            store,
            breaker,
            config,
            stats: AtomicCacheStats::default(),
        })
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn breaker_snapshot(&self) -> CircuitBreakerSnapshot {
        self.breaker.snapshot()
    }

    /// TTL actually sent to the store, jitter included
    fn effective_ttl(&self, ttl: Option<Duration>) -> Duration {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        if self.config.ttl_jitter <= 0.0 {
            return ttl;
        }
        let fraction = rand::thread_rng().gen_range(0.0..=self.config.ttl_jitter);
        let extra =
            Duration::try_from_secs_f64(ttl.as_secs_f64() * fraction).unwrap_or(Duration::MAX);
        ttl.saturating_add(extra)
    }

    /// Run a remote call under the breaker, degrading any failure to `None`
    async fn guarded<T, F>(&self, op: &'static str, key: &str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.breaker.call(fut).await {
            Ok(value) => Some(value),
            Err(CircuitBreakerError::Open(_)) => {
                self.stats.error();
                debug!(op, key = %key, "[L2] Circuit open, call skipped");
                None
            }
            Err(CircuitBreakerError::Inner(e)) => {
                self.stats.error();
                warn!(op, key = %key, error = %e, "[L2] Remote call failed");
                None
            }
        }
    }
}

/// Encode a value for transmission, falling back to its display form
fn encode(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

/// Decode a stored payload; anything that is not JSON comes back as a string
fn decode(raw: String) -> Value {
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(_) => Value::String(raw),
    }
}

#[async_trait]
impl CacheBackend for L2Cache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.guarded("get", key, self.store.get(key)).await {
            Some(Some(raw)) => {
                self.stats.hit();
                Ok(Some(decode(raw)))
            }
            _ => {
                self.stats.miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let ttl = self.effective_ttl(ttl);
        let payload = encode(&value);

        let stored = self
            .guarded("set", key, self.store.set(key, &payload, ttl))
            .await
            .is_some();
        if stored {
            self.stats.set();
            debug!(key = %key, ttl_ms = ttl.as_millis(), "[L2] Cached key with TTL");
        }
        Ok(stored)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self
            .guarded("delete", key, self.store.delete(key))
            .await
            .unwrap_or(false);
        if removed {
            self.stats.delete();
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .guarded("exists", key, self.store.exists(key))
            .await
            .unwrap_or(false))
    }

    async fn clear(&self) -> Result<bool> {
        Ok(self
            .guarded("clear", "*", self.store.clear())
            .await
            .is_some())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        compile_pattern(pattern)?;
        Ok(self
            .guarded("scan", pattern, self.store.scan(pattern))
            .await
            .unwrap_or_default())
    }

    async fn health_check(&self) -> bool {
        self.guarded("ping", "", self.store.ping()).await.is_some()
    }

    fn name(&self) -> &'static str {
        "L2"
    }

    fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}

#[async_trait]
impl L2CacheBackend for L2Cache {
    async fn publish(&self, channel: &str, message: &str) -> Result<bool> {
        Ok(self
            .guarded("publish", channel, self.store.publish(channel, message))
            .await
            .is_some())
    }

    async fn subscribe(&self, channel: &str) -> Result<Option<MessageStream>> {
        Ok(self
            .guarded("subscribe", channel, self.store.subscribe(channel))
            .await
            .flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use serde_json::json;

    fn l2_over(store: InMemoryStore) -> L2Cache {
        let breaker = Arc::new(CircuitBreaker::new(
            store.identity(),
            CircuitBreakerConfig::default(),
        ));
        L2Cache::new(Arc::new(store), breaker, L2CacheConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_values_round_trip_as_json() {
        let store = InMemoryStore::new();
        let l2 = l2_over(store.clone());
        l2.set("k", json!({"n": [1, 2]}), None).await.unwrap();

        assert_eq!(
            store.get("k").await.unwrap(),
            Some(r#"{"n":[1,2]}"#.to_string())
        );
        assert_eq!(l2.get("k").await.unwrap(), Some(json!({"n": [1, 2]})));
    }

    #[tokio::test]
    async fn test_non_json_payload_reads_as_string() {
        let store = InMemoryStore::new();
        store
            .set("legacy", "not json {", Duration::from_secs(5))
            .await
            .unwrap();
        let l2 = l2_over(store);

        assert_eq!(l2.get("legacy").await.unwrap(), Some(json!("not json {")));
    }

    #[test]
    fn test_rejects_out_of_range_jitter() {
        let store = InMemoryStore::new();
        let breaker = Arc::new(CircuitBreaker::new("x", CircuitBreakerConfig::default()));
        let result = L2Cache::new(
            Arc::new(store),
            breaker,
            L2CacheConfig {
                ttl_jitter: 1.5,
                ..L2CacheConfig::default()
            },
        );
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_huge_ttl_saturates() {
        let store = InMemoryStore::new();
        let breaker = Arc::new(CircuitBreaker::new("x", CircuitBreakerConfig::default()));
        let l2 = L2Cache::new(
            Arc::new(store),
            breaker,
            L2CacheConfig {
                ttl_jitter: 0.5,
                ..L2CacheConfig::default()
            },
        )
        .unwrap();

        assert_eq!(l2.effective_ttl(Some(Duration::MAX)), Duration::MAX);
        let half = Duration::from_secs(u64::MAX / 2 + 1);
        assert!(l2.effective_ttl(Some(half)) >= half);

        assert!(l2.set("forever", json!(1), Some(Duration::MAX)).await.unwrap());
        assert!(l2.set("long", json!(2), Some(half)).await.unwrap());
        assert_eq!(l2.get("forever").await.unwrap(), Some(json!(1)));
        assert_eq!(l2.get("long").await.unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_jitter_only_extends_ttl() {
        let store = InMemoryStore::new();
        let breaker = Arc::new(CircuitBreaker::new("x", CircuitBreakerConfig::default()));
        let l2 = L2Cache::new(
            Arc::new(store),
            breaker,
            L2CacheConfig {
                default_ttl: Duration::from_secs(100),
                ttl_jitter: 0.2,
            },
        )
        .unwrap();

        for _ in 0..50 {
            let ttl = l2.effective_ttl(None);
            assert!(ttl >= Duration::from_secs(100));
            assert!(ttl <= Duration::from_secs(120));
        }
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_caller_error() {
        let l2 = l2_over(InMemoryStore::new());
        assert!(l2.scan_keys("[").await.is_err());
        assert_eq!(l2.breaker().state(), CircuitState::Closed);
    }
}
