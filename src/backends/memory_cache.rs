//! Memory Cache - In-Process L1 Backend
//!
//! Bounded local store: an ordered map (most-recently-used at the back) behind
//! a single mutex. No I/O ever happens while the lock is held.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use super::{CacheEntry, KEY_MATCH, compile_pattern};
use crate::stats::{AtomicCacheStats, CacheStatsSnapshot};
use crate::traits::CacheBackend;

/// Configuration for `MemoryCache`
#[derive(Debug, Clone, Copy)]
pub struct MemoryCacheConfig {
    /// Max number of entries before the least-recently-used one is evicted
    pub max_size: usize,
    /// TTL used when `set` is called without one
    pub default_ttl: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Duration::from_secs(300),
        }
    }
}

/// In-process LRU cache with per-key TTL
///
/// This is the default L1 (hot tier) backend:
/// - `set` moves an existing key to the MRU position, or inserts it there and
///   evicts the LRU entry once the size exceeds `max_size`
/// - `get` and `exists` drop expired entries lazily
/// - `scan_keys` skips expired entries without deleting them
pub struct MemoryCache {
    /// Ordered map, guarded as a whole
    entries: Mutex<LruCache<String, CacheEntry<Value>>>,
    config: MemoryCacheConfig,
    stats: AtomicCacheStats,
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> Self {
        info!(
            max_size = config.max_size,
            default_ttl_ms = config.default_ttl.as_millis(),
            "Initializing Memory Cache (L1)"
        );

        Self {
            entries: Mutex::new(LruCache::unbounded()),
            config: MemoryCacheConfig {
                max_size: config.max_size.max(1),
                ..config
            },
            stats: AtomicCacheStats::default(),
        }
    }

    /// Current number of stored entries, expired ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "[L1] Purged expired entries");
        }
        expired.len()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(MemoryCacheConfig::default())
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut entries = self.entries.lock();

        let expired = match entries.peek(key) {
            None => {
                self.stats.miss();
                return Ok(None);
            }
            Some(entry) => entry.is_expired(),
        };

        if expired {
            entries.pop(key);
            self.stats.miss();
            return Ok(None);
        }

        self.stats.hit();
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let mut entries = self.entries.lock();

        entries.put(key.to_string(), CacheEntry::new(value, ttl));
        while entries.len() > self.config.max_size {
            if let Some((evicted, _)) = entries.pop_lru() {
                self.stats.eviction();
                debug!(key = %evicted, "[L1] Evicted least-recently-used entry");
            }
        }
        drop(entries);

        self.stats.set();
        debug!(key = %key, ttl_ms = ttl.as_millis(), "[L1] Cached key with TTL");
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.entries.lock().pop(key).is_some();
        if removed {
            self.stats.delete();
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        match entries.peek(key).map(CacheEntry::is_expired) {
            None => Ok(false),
            Some(true) => {
                entries.pop(key);
                Ok(false)
            }
            Some(false) => Ok(true),
        }
    }

    async fn clear(&self) -> Result<bool> {
        self.entries.lock().clear();
        info!("[L1] Cleared all entries");
        Ok(true)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = compile_pattern(pattern)?;
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|(key, entry)| !entry.is_expired() && matcher.matches_with(key, KEY_MATCH))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn name(&self) -> &'static str {
        "Memory"
    }

    fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}
