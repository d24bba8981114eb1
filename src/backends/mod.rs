//! Cache Backend Implementations
//!
//! # Available Backends
//!
//! ## In-Process (L1 Tier)
//! - **`MemoryCache`** - Ordered-map LRU cache with per-key TTL (default L1)
//! - **`StrategicMemoryCache`** - Same storage model with a pluggable [`EvictionPolicy`](crate::eviction::EvictionPolicy)
//!
//! ## Remote Stores (under the L2 Tier)
//! - **`RedisStore`** - Redis via `ConnectionManager` and async pub/sub (feature: `redis`)
//! - **`InMemoryStore`** - Process-local stand-in sharing state between handles
//!
//! # Usage
//!
//! ```rust,no_run
//! use multi_level_cache::backends::{InMemoryStore, MemoryCache, MemoryCacheConfig};
//!
//! let l1 = MemoryCache::new(MemoryCacheConfig::default());
//! let shared = InMemoryStore::new();
//! ```

pub mod in_memory_store;
pub mod memory_cache;
pub mod strategic_cache;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use in_memory_store::InMemoryStore;
pub use memory_cache::{MemoryCache, MemoryCacheConfig};
pub use strategic_cache::StrategicMemoryCache;

#[cfg(feature = "redis")]
pub use redis_store::{RedisStore, RedisStoreConfig};

use std::time::{Duration, Instant};

use crate::error::CacheError;

/// Horizon used when a TTL does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Stored value with its expiry instant
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: expiry_after(ttl),
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Expiry instant for `ttl` from now, saturating for huge TTLs such as `Duration::MAX`
pub(crate) fn expiry_after(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Compile a glob-style key pattern
pub(crate) fn compile_pattern(pattern: &str) -> Result<glob::Pattern, CacheError> {
    glob::Pattern::new(pattern).map_err(|source| CacheError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Match options for keys: `*` and `?` also match `/`
pub(crate) const KEY_MATCH: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};
