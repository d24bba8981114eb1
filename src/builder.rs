//! Cache System Builder
//!
//! Composition root: wires L1, the remote store, the breaker, L2 and the
//! coordinator together from one [`CacheConfig`].
//!
//! # Example: Defaults From the Environment
//!
//! ```rust,no_run
//! use multi_level_cache::{CacheConfig, CacheSystemBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let system = CacheSystemBuilder::new()
//!         .with_config(CacheConfig::from_env()?)
//!         .build()
//!         .await?;
//!     system.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Example: Two Nodes Sharing One Store
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use multi_level_cache::CacheSystemBuilder;
//! use multi_level_cache::backends::InMemoryStore;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let shared = InMemoryStore::new();
//! let node_a = CacheSystemBuilder::new()
//!     .with_remote_store(Arc::new(shared.clone()))
//!     .with_node_id("node-a")
//!     .build()
//!     .await?;
//! let node_b = CacheSystemBuilder::new()
//!     .with_remote_store(Arc::new(shared))
//!     .with_node_id("node-b")
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backends::{InMemoryStore, MemoryCache, MemoryCacheConfig};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::{BackendKind, CacheConfig};
use crate::invalidation_manager::InvalidationManager;
use crate::l2_cache::{L2Cache, L2CacheConfig};
use crate::multi_level::{MultiLevelCache, MultiLevelConfig};
use crate::namespaced::NamespacedCache;
use crate::traits::{CacheBackend, L2CacheBackend, RemoteStore};
use crate::warmer::CacheWarmer;
use crate::CacheSystem;

/// Builder for [`CacheSystem`]
///
/// Anything not supplied explicitly is derived from the config:
/// - **L1**: `MemoryCache` sized by `l1_max_size`
/// - **Remote store**: `InMemoryStore` or `RedisStore` per `backend`
/// - **Node id**: a random UUID
#[derive(Default)]
pub struct CacheSystemBuilder {
    config: CacheConfig,
    l1_backend: Option<Arc<dyn CacheBackend>>,
    remote_store: Option<Arc<dyn RemoteStore>>,
    node_id: Option<String>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
}

impl CacheSystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom L1 backend instead of `MemoryCache`
    #[must_use]
    pub fn with_l1(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.l1_backend = Some(backend);
        self
    }

    /// Use this store under L2 instead of the one `config.backend` selects
    #[must_use]
    pub fn with_remote_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.remote_store = Some(store);
        self
    }

    #[must_use]
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Share breakers with other systems talking to the same stores
    #[must_use]
    pub fn with_breaker_registry(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Build the system and start its background tasks
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the remote store cannot be
    /// reached at construction time.
    pub async fn build(self) -> Result<CacheSystem> {
        let config = self.config;
        config.validate()?;
        info!(backend = ?config.backend, namespace = ?config.namespace, "Building Cache System");

        let l1 = self.l1_backend.unwrap_or_else(|| {
            Arc::new(MemoryCache::new(MemoryCacheConfig {
                max_size: config.l1_max_size,
                default_ttl: config.l1_default_ttl,
            }))
        });

        let store = match self.remote_store {
            Some(store) => store,
            None => connect_store(&config).await?,
        };

        let breakers = self.breakers.unwrap_or_default();
        let breaker = breakers.get_or_create(&store.identity(), config.circuit_breaker);

        let l2: Arc<dyn L2CacheBackend> = Arc::new(L2Cache::new(
            store,
            breaker,
            L2CacheConfig {
                default_ttl: config.default_ttl,
                ttl_jitter: config.ttl_jitter,
            },
        )?);

        let mut ml_config = MultiLevelConfig {
            sync_l1: config.sync_l1,
            l1_backfill_ttl: config.l1_backfill_ttl,
            channel: config.invalidation_channel.clone(),
            ..MultiLevelConfig::default()
        };
        if let Some(node_id) = self.node_id {
            ml_config.node_id = node_id;
        }
        let coordinator = Arc::new(MultiLevelCache::new(l1, l2, ml_config).await);

        let cache: Arc<dyn CacheBackend> = match &config.namespace {
            Some(namespace) => Arc::new(NamespacedCache::new(
                Arc::clone(&coordinator) as Arc<dyn CacheBackend>,
                namespace,
            )?),
            None => Arc::clone(&coordinator) as Arc<dyn CacheBackend>,
        };

        let monitor = spawn_health_monitor(
            Arc::clone(coordinator.l2()),
            config.health_check_interval,
        );

        info!(node_id = %coordinator.node_id(), "Cache System built successfully");

        Ok(CacheSystem {
            invalidation: Arc::new(InvalidationManager::new(Arc::clone(&cache))),
            warmer: Arc::new(CacheWarmer::new(Arc::clone(&cache))),
            cache,
            coordinator,
            breakers,
            monitor: Arc::new(Mutex::new(Some(monitor))),
        })
    }
}

async fn connect_store(config: &CacheConfig) -> Result<Arc<dyn RemoteStore>> {
    match config.backend {
        BackendKind::Memory => Ok(Arc::new(InMemoryStore::new())),
        #[cfg(feature = "redis")]
        BackendKind::Redis => {
            let store = crate::backends::RedisStore::with_config(crate::backends::RedisStoreConfig {
                url: config.redis_url.clone(),
                connect_timeout: config.connect_timeout,
                socket_timeout: config.socket_timeout,
            })
            .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        BackendKind::Redis => anyhow::bail!("redis backend requires the `redis` feature"),
    }
}

/// Periodically ping L2 and log when its health changes
fn spawn_health_monitor(l2: Arc<dyn L2CacheBackend>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        interval.tick().await;

        let mut healthy = true;
        loop {
            interval.tick().await;
            let now_healthy = l2.health_check().await;
            if now_healthy != healthy {
                if now_healthy {
                    info!("L2 tier recovered");
                } else {
                    warn!("L2 tier unhealthy, serving from L1 only");
                }
                healthy = now_healthy;
            }
        }
    })
}
