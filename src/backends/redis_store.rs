//! Redis Store - Distributed Remote Store
//!
//! Redis-backed [`RemoteStore`] for the shared L2 tier.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info, warn};

use crate::traits::{MessageStream, RemoteStore};

/// Connection settings for `RedisStore`
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection string (e.g., `redis://localhost:6379`)
    pub url: String,
    /// Upper bound on establishing a connection
    pub connect_timeout: Duration,
    /// Upper bound on a single command round trip
    pub socket_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(5),
        }
    }
}

/// Redis store with `ConnectionManager` for automatic reconnection
///
/// Commands share one multiplexed connection; every subscription opens its own
/// pub/sub connection. Each command is bounded by `socket_timeout` so one slow
/// call never stalls unrelated keys.
pub struct RedisStore {
    /// Client used to open pub/sub connections
    client: Client,
    /// Redis connection manager - handles reconnection automatically
    conn_manager: ConnectionManager,
    config: RedisStoreConfig,
}

impl RedisStore {
    /// Connect with default settings, honoring the `REDIS_URL` environment variable
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn new() -> Result<Self> {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        Self::with_config(RedisStoreConfig {
            url,
            ..RedisStoreConfig::default()
        })
        .await
    }

    /// Connect with explicit settings
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created, the connection times
    /// out, or the initial PING fails.
    pub async fn with_config(config: RedisStoreConfig) -> Result<Self> {
        info!(redis_url = %config.url, "Initializing Redis Store with ConnectionManager");

        let client = Client::open(config.url.as_str())
            .with_context(|| format!("Failed to create Redis client with URL: {}", config.url))?;

        let conn_manager = tokio::time::timeout(
            config.connect_timeout,
            ConnectionManager::new(client.clone()),
        )
        .await
        .context("Timed out connecting to Redis")?
        .context("Failed to establish Redis connection manager")?;

        let store = Self {
            client,
            conn_manager,
            config,
        };
        store.ping().await.context("Redis PING health check failed")?;

        info!(redis_url = %store.config.url, "Redis Store connected successfully");
        Ok(store)
    }

    /// Run a command future under the socket timeout
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>> + Send,
    {
        match tokio::time::timeout(self.config.socket_timeout, fut).await {
            Ok(result) => result.with_context(|| format!("Redis {op} failed")),
            Err(_) => Err(anyhow::anyhow!(
                "Redis {op} timed out after {:?}",
                self.config.socket_timeout
            )),
        }
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn_manager.clone();
        self.bounded("GET", conn.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        self.bounded("PSETEX", conn.pset_ex(key, value, millis))
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let removed: usize = self.bounded("DEL", conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        self.bounded("EXISTS", conn.exists(key)).await
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        self.bounded("FLUSHDB", redis::cmd("FLUSHDB").query_async(&mut conn))
            .await
    }

    /// Scan keys with the cursor-based SCAN command (non-blocking, unlike KEYS)
    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            // SCAN cursor MATCH pattern COUNT 100
            let (next, batch): (u64, Vec<String>) = self
                .bounded(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn),
                )
                .await?;

            cursor = next;
            keys.extend(batch);

            // Cursor 0 means iteration is complete
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, count = keys.len(), "[Redis] Scanned keys matching pattern");
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let receivers: usize = self
            .bounded("PUBLISH", conn.publish(channel, message))
            .await?;
        debug!(channel = %channel, receivers, "[Redis] Published message");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Option<MessageStream>> {
        let mut pubsub = tokio::time::timeout(
            self.config.connect_timeout,
            self.client.get_async_pubsub(),
        )
        .await
        .context("Timed out opening Redis pub/sub connection")?
        .context("Failed to get pubsub connection")?;

        pubsub
            .subscribe(channel)
            .await
            .context("Failed to subscribe to channel")?;

        info!(channel = %channel, "[Redis] Subscribed to channel");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(error = %e, "[Redis] Failed to get message payload");
                    None
                }
            }
        });
        Ok(Some(stream.boxed()))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: String = self
            .bounded("PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    fn identity(&self) -> String {
        self.config.url.clone()
    }
}
