//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - Tracing setup
//! - Node construction over a shared in-memory store
//! - Remote stores that fail on demand
//! - Polling helpers for asynchronous invalidation

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use multi_level_cache::{
    CacheBackend, CircuitBreaker, CircuitBreakerConfig, InMemoryStore, L2Cache, L2CacheBackend,
    L2CacheConfig, MemoryCache, MemoryCacheConfig, MessageStream, MultiLevelCache,
    MultiLevelConfig, RemoteStore, async_trait,
};

/// Install a test subscriber honoring `RUST_LOG`; repeated calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a test key with unique suffix
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

pub fn breaker_config(failure_threshold: u32, timeout: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        timeout,
        ..CircuitBreakerConfig::default()
    }
}

/// L2 tier over `store` with its own breaker
pub fn l2_over(store: Arc<dyn RemoteStore>, breaker: CircuitBreakerConfig) -> Arc<L2Cache> {
    let breaker = Arc::new(CircuitBreaker::new(store.identity(), breaker));
    Arc::new(
        L2Cache::new(store, breaker, L2CacheConfig::default())
            .unwrap_or_else(|e| panic!("Failed to build L2: {e}")),
    )
}

/// One coordinator plus direct handles on its tiers
pub struct TestNode {
    pub cache: Arc<MultiLevelCache>,
    pub l1: Arc<MemoryCache>,
    pub l2: Arc<L2Cache>,
}

/// Build a coordinator named `node_id` on top of a (possibly shared) store
pub async fn node(store: &InMemoryStore, node_id: &str) -> TestNode {
    node_with(Arc::new(store.clone()), node_id, MultiLevelConfig::default()).await
}

pub async fn node_with(
    store: Arc<dyn RemoteStore>,
    node_id: &str,
    config: MultiLevelConfig,
) -> TestNode {
    init_tracing();
    let l1 = Arc::new(MemoryCache::new(MemoryCacheConfig::default()));
    let l2 = l2_over(store, CircuitBreakerConfig::default());
    let cache = MultiLevelCache::new(
        Arc::clone(&l1) as Arc<dyn CacheBackend>,
        Arc::clone(&l2) as Arc<dyn L2CacheBackend>,
        MultiLevelConfig {
            node_id: node_id.to_string(),
            ..config
        },
    )
    .await;

    TestNode {
        cache: Arc::new(cache),
        l1,
        l2,
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Remote store where every call fails, counting attempts
#[derive(Default)]
pub struct FailingStore {
    pub calls: AtomicU32,
}

impl FailingStore {
    fn fail<T>(&self, op: &str) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        bail!("connection refused during {op}")
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        self.fail("get")
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
        self.fail("set")
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        self.fail("delete")
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        self.fail("exists")
    }

    async fn clear(&self) -> Result<()> {
        self.fail("clear")
    }

    async fn scan(&self, _pattern: &str) -> Result<Vec<String>> {
        self.fail("scan")
    }

    async fn publish(&self, _channel: &str, _message: &str) -> Result<()> {
        self.fail("publish")
    }

    async fn subscribe(&self, _channel: &str) -> Result<Option<MessageStream>> {
        self.fail("subscribe")
    }

    async fn ping(&self) -> Result<()> {
        self.fail("ping")
    }

    fn identity(&self) -> String {
        "failing://".to_string()
    }
}

/// In-memory store that can be switched into a failing state
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryStore,
    pub down: AtomicBool,
}

impl FlakyStore {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            bail!("remote store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.check()?;
        self.inner.clear().await
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        self.inner.scan(pattern).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.check()?;
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Option<MessageStream>> {
        self.check()?;
        self.inner.subscribe(channel).await
    }

    async fn ping(&self) -> Result<()> {
        self.check()?;
        self.inner.ping().await
    }

    fn identity(&self) -> String {
        self.inner.identity()
    }
}

/// Test data generators
pub mod test_data {
    use serde_json::{Value, json};

    pub fn json_user(id: u64) -> Value {
        json!({
            "id": id,
            "name": format!("user_{id}"),
            "email": format!("user{id}@example.com"),
        })
    }
}
