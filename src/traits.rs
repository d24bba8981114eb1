//! Cache Backend Traits
//!
//! This module defines the trait abstractions shared by every cache tier and
//! decorator in the crate.
//!
//! # Architecture
//!
//! - `CacheBackend`: Core trait for all cache implementations and decorators
//! - `L2CacheBackend`: Extended trait for shared tiers that can broadcast invalidations
//! - `RemoteStore`: Raw networked store underneath the L2 tier (Redis, in-memory stand-in)
//!
//! # Example: Custom Backend
//!
//! ```rust,ignore
//! use multi_level_cache::{CacheBackend, async_trait};
//! use std::time::Duration;
//! use anyhow::Result;
//!
//! struct MyCustomCache {
//!     // Your implementation
//! }
//!
//! #[async_trait]
//! impl CacheBackend for MyCustomCache {
//!     async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
//!         // Your implementation
//!     }
//!
//!     async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<bool> {
//!         // Your implementation
//!     }
//!
//!     // ... delete, exists, clear, scan_keys
//! }
//! ```

use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::Stream;
use serde_json::Value;

use crate::stats::CacheStatsSnapshot;

/// Stream of raw pub/sub payloads
pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Core cache backend trait for both tiers and all decorators
///
/// # Failure Semantics
///
/// Implementations backed by a network must degrade infrastructure failures:
/// an unreachable store reports a miss (`Ok(None)`, `Ok(false)`), never an
/// error. `Err` is reserved for caller mistakes such as an invalid glob
/// pattern. Callers still treat an `Err` from any tier as a miss for that tier.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to support concurrent access across async tasks.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get value by key
    ///
    /// # Returns
    ///
    /// * `Ok(Some(value))` - Value present and not expired
    /// * `Ok(None)` - Key not found, expired or tier unavailable
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store value with a time-to-live
    ///
    /// `None` uses the backend's configured default TTL. The write replaces any
    /// previous value atomically.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Value stored
    /// * `Ok(false)` - Write did not happen (tier unavailable)
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool>;

    /// Remove a key, returning whether it was present
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Check existence honoring expiry
    ///
    /// An expired entry must report `false` and be removed as a side effect.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove every entry visible to this backend
    async fn clear(&self) -> Result<bool>;

    /// Enumerate keys matching a glob-style pattern (`*`, `?`, `[...]`)
    ///
    /// Callers must not assume any ordering.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Check if cache backend is healthy
    async fn health_check(&self) -> bool {
        let test_key = "__health_check__";
        match self
            .set(test_key, Value::Bool(true), Some(Duration::from_secs(10)))
            .await
        {
            Ok(true) => {
                let found = matches!(self.get(test_key).await, Ok(Some(Value::Bool(true))));
                let _ = self.delete(test_key).await;
                found
            }
            _ => false,
        }
    }

    /// Get the name of this cache backend, used for logging
    fn name(&self) -> &'static str {
        "unknown"
    }

    /// Point-in-time counters
    fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot::default()
    }
}

/// Extended trait for the shared (L2) tier
///
/// Adds the broadcast medium used for cross-instance invalidation. Both
/// operations follow the same degrade-not-fail rule as [`CacheBackend`].
#[async_trait]
pub trait L2CacheBackend: CacheBackend {
    /// Publish a message on a channel, returning whether it was sent
    async fn publish(&self, channel: &str, message: &str) -> Result<bool>;

    /// Subscribe to a channel
    ///
    /// # Returns
    ///
    /// * `Ok(Some(stream))` - Subscription established
    /// * `Ok(None)` - Backend has no pub/sub support or is unavailable
    async fn subscribe(&self, channel: &str) -> Result<Option<MessageStream>>;
}

/// Raw networked key-value store underneath the L2 tier
///
/// Values travel as strings; encoding is the L2 tier's job. Unlike
/// [`CacheBackend`], every failure is returned as an error so the circuit
/// breaker above can count it.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn clear(&self) -> Result<()>;

    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// `Ok(None)` when the store has no pub/sub capability
    async fn subscribe(&self, channel: &str) -> Result<Option<MessageStream>>;

    async fn ping(&self) -> Result<()>;

    /// Stable identity of the store, used to key circuit breakers
    fn identity(&self) -> String;
}
