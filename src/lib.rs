//! Multi-Level Cache
//!
//! A two-tier caching library for services running as several instances:
//! - **L1 Cache**: In-process, bounded, TTL + LRU/LFU eviction (no I/O)
//! - **L2 Cache**: Shared remote store (Redis) behind a circuit breaker
//! - **Cross-Instance Invalidation**: Pub/sub messages purge stale L1 copies on peers
//! - **Cache Stampede Protection**: Per-key request coalescing in `get_or_set`
//! - **Namespaces, Tags, Patterns**: Tenant isolation and bulk invalidation
//! - **Cache Warming**: Prioritized concurrent loaders at startup
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use multi_level_cache::{CacheBackend, CacheSystem};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Configured from CACHE_* environment variables
//!     let system = CacheSystem::new().await?;
//!
//!     let data = serde_json::json!({"user": "alice", "score": 100});
//!     system.cache.set("user:1", data, None).await?;
//!
//!     // L1 first, then L2 with backfill
//!     if let Some(cached) = system.cache.get("user:1").await? {
//!         tracing::info!("Cached data: {}", cached);
//!     }
//!
//!     let stats = system.coordinator.get_stats();
//!     tracing::info!("Hit rate: {:.2}%", stats.hit_rate);
//!
//!     system.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! caller → NamespacedCache → MultiLevelCache → L1 (hit: return)
//!                                            → L2 via CircuitBreaker (hit: backfill L1)
//! write  → L2 → L1 → publish "{node_id}:{key}" → peers drop key from their L1
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod backends;
pub mod builder;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod eviction;
pub mod invalidation;
pub mod invalidation_manager;
pub mod l2_cache;
pub mod multi_level;
pub mod namespaced;
pub mod stats;
pub mod traits;
pub mod warmer;

pub use backends::{InMemoryStore, MemoryCache, MemoryCacheConfig, StrategicMemoryCache};
#[cfg(feature = "redis")]
pub use backends::{RedisStore, RedisStoreConfig};
pub use builder::CacheSystemBuilder;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitBreakerSnapshot, CircuitState,
};
pub use config::{BackendKind, CacheConfig};
pub use error::{CacheError, CacheResult};
pub use eviction::{EvictionPolicy, LfuPolicy, LruPolicy};
pub use invalidation::{InvalidationListener, InvalidationMessage};
pub use invalidation_manager::InvalidationManager;
pub use l2_cache::{L2Cache, L2CacheConfig};
pub use multi_level::{MultiLevelCache, MultiLevelConfig};
pub use namespaced::NamespacedCache;
pub use stats::{CacheStatsSnapshot, MultiLevelStats};
pub use traits::{CacheBackend, L2CacheBackend, MessageStream, RemoteStore};
pub use warmer::CacheWarmer;

// Re-export async_trait for user convenience
pub use async_trait::async_trait;

/// Main entry point: a fully wired cache for one service instance
///
/// Use `cache` for all reads and writes. It is the coordinator, wrapped in a
/// `NamespacedCache` when a namespace is configured; `invalidation` and
/// `warmer` operate on that same view.
#[derive(Clone)]
pub struct CacheSystem {
    /// Primary interface (namespaced if configured)
    pub cache: Arc<dyn CacheBackend>,
    /// The L1/L2 coordinator, for `get_or_set` and statistics
    pub coordinator: Arc<MultiLevelCache>,
    pub invalidation: Arc<InvalidationManager>,
    pub warmer: Arc<CacheWarmer>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub(crate) monitor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CacheSystem {
    /// Create a cache system configured from the environment
    ///
    /// See [`CacheConfig::from_env`] for the variables read.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the remote store
    /// cannot be reached.
    pub async fn new() -> anyhow::Result<Self> {
        info!("Initializing Multi-Level Cache System");
        CacheSystemBuilder::new()
            .with_config(CacheConfig::from_env()?)
            .build()
            .await
    }

    /// Perform health check on both tiers
    ///
    /// Returns `true` if at least L1 is operational.
    /// L2 failure is tolerated (graceful degradation).
    pub async fn health_check(&self) -> bool {
        let l1_ok = self.coordinator.l1().health_check().await;
        let l2_ok = self.coordinator.l2().health_check().await;

        if l1_ok && l2_ok {
            info!("Multi-Level Cache health check passed");
        } else {
            warn!(l1_ok, l2_ok, "Multi-Level Cache health check - partial failure");
        }
        l1_ok
    }

    /// Stop the health monitor and the invalidation listener
    ///
    /// Safe to call more than once, and from any clone.
    pub async fn close(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(handle) = monitor {
            handle.abort();
            let _ = handle.await;
        }
        self.coordinator.close().await;
    }
}
