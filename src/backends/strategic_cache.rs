//! Strategic Memory Cache - policy-driven in-process backend
//!
//! Stores `(value, expiry)` pairs and leaves every eviction decision to an
//! injected [`EvictionPolicy`], so the same storage engine runs under LRU or
//! LFU without duplicating code.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use super::{CacheEntry, KEY_MATCH, compile_pattern};
use crate::eviction::{EvictionPolicy, LfuPolicy, LruPolicy};
use crate::stats::{AtomicCacheStats, CacheStatsSnapshot};
use crate::traits::CacheBackend;

struct Inner {
    entries: HashMap<String, CacheEntry<Value>>,
    policy: Box<dyn EvictionPolicy>,
}

impl Inner {
    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_some() {
            self.policy.on_remove(key);
            true
        } else {
            false
        }
    }
}

/// In-process cache with pluggable eviction
///
/// # Example
///
/// ```rust
/// use multi_level_cache::backends::StrategicMemoryCache;
/// use std::time::Duration;
///
/// let lfu = StrategicMemoryCache::with_lfu(500, Duration::from_secs(60));
/// ```
pub struct StrategicMemoryCache {
    inner: Mutex<Inner>,
    default_ttl: Duration,
    policy_name: &'static str,
    stats: AtomicCacheStats,
}

impl StrategicMemoryCache {
    pub fn new(policy: impl EvictionPolicy + 'static, default_ttl: Duration) -> Self {
        let policy_name = policy.name();
        info!(policy = policy_name, "Initializing Strategic Memory Cache");

        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                policy: Box::new(policy),
            }),
            default_ttl,
            policy_name,
            stats: AtomicCacheStats::default(),
        }
    }

    pub fn with_lru(capacity: usize, default_ttl: Duration) -> Self {
        Self::new(LruPolicy::new(capacity), default_ttl)
    }

    pub fn with_lfu(capacity: usize, default_ttl: Duration) -> Self {
        Self::new(LfuPolicy::new(capacity), default_ttl)
    }

    /// Name of the injected policy
    #[must_use]
    pub fn policy(&self) -> &'static str {
        self.policy_name
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for StrategicMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut inner = self.inner.lock();

        let expired = inner.entries.get(key).map(CacheEntry::is_expired);
        let value = match expired {
            None => None,
            Some(true) => {
                inner.remove(key);
                None
            }
            Some(false) => inner.entries.get(key).map(|entry| entry.value.clone()),
        };

        if value.is_some() {
            inner.policy.on_access(key);
            self.stats.hit();
        } else {
            self.stats.miss();
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut inner = self.inner.lock();

        let existed = inner
            .entries
            .insert(key.to_string(), CacheEntry::new(value, ttl))
            .is_some();

        if existed {
            inner.policy.on_access(key);
        } else if let Some(victim) = inner.policy.on_add(key) {
            inner.entries.remove(&victim);
            self.stats.eviction();
            debug!(key = %victim, policy = self.policy_name, "Evicted entry");
        }
        drop(inner);

        self.stats.set();
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.inner.lock().remove(key);
        if removed {
            self.stats.delete();
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key).map(CacheEntry::is_expired) {
            None => Ok(false),
            Some(true) => {
                inner.remove(key);
                Ok(false)
            }
            Some(false) => Ok(true),
        }
    }

    async fn clear(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.policy.clear();
        Ok(true)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = compile_pattern(pattern)?;
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .iter()
            .filter(|(key, entry)| !entry.is_expired() && matcher.matches_with(key, KEY_MATCH))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn name(&self) -> &'static str {
        "StrategicMemory"
    }

    fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}
