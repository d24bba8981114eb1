//! In-Memory Store - process-local remote store
//!
//! Behaves like a shared networked store: cloned handles see the same data and
//! the same pub/sub channels. Used for the `memory` backend kind and for
//! running several coordinators against one "remote" in tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use super::{CacheEntry, KEY_MATCH, compile_pattern};
use crate::traits::{MessageStream, RemoteStore};

const CHANNEL_CAPACITY: usize = 1024;

/// Same floor Redis `PSETEX` gets
const MIN_TTL: Duration = Duration::from_millis(1);

/// Shared in-process key-value store with pub/sub
#[derive(Clone)]
pub struct InMemoryStore {
    data: Arc<Mutex<HashMap<String, CacheEntry<String>>>>,
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
    identity: Arc<str>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_identity(&format!("memory://{}", uuid::Uuid::new_v4()))
    }

    /// Create a store with a fixed identity, for breaker sharing across handles
    pub fn with_identity(identity: &str) -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            channels: Arc::new(DashMap::new()),
            identity: Arc::from(identity),
        }
    }

    /// Number of stored entries, expired ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut data = self.data.lock();
        let expired = match data.get(key) {
            None => return Ok(None),
            Some(entry) => entry.is_expired(),
        };
        if expired {
            data.remove(key);
            return Ok(None);
        }
        Ok(data.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.data
            .lock()
            .insert(key.to_string(), CacheEntry::new(value.to_string(), ttl.max(MIN_TTL)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self
            .data
            .lock()
            .remove(key)
            .is_some_and(|entry| !entry.is_expired()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut data = self.data.lock();
        match data.get(key).map(CacheEntry::is_expired) {
            None => Ok(false),
            Some(true) => {
                data.remove(key);
                Ok(false)
            }
            Some(false) => Ok(true),
        }
    }

    async fn clear(&self) -> Result<()> {
        self.data.lock().clear();
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = compile_pattern(pattern)?;
        let data = self.data.lock();
        Ok(data
            .iter()
            .filter(|(key, entry)| !entry.is_expired() && matcher.matches_with(key, KEY_MATCH))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        // No receivers is not an error: nobody is listening yet
        let receivers = self.sender(channel).send(message.to_string()).unwrap_or(0);
        debug!(channel = %channel, receivers, "[InMemory] Published message");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Option<MessageStream>> {
        let receiver = self.sender(channel).subscribe();
        let channel = channel.to_string();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            let channel = channel.clone();
            async move {
                match item {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "[InMemory] Subscriber lagged, messages dropped");
                        None
                    }
                }
            }
        });
        Ok(Some(stream.boxed()))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn identity(&self) -> String {
        self.identity.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_state() {
        let a = InMemoryStore::new();
        let b = a.clone();
        a.set("k", "v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(a.identity(), b.identity());
    }

    #[tokio::test]
    async fn test_pubsub_fan_out() {
        let store = InMemoryStore::new();
        let mut first = store.subscribe("chan").await.unwrap().unwrap();
        let mut second = store.subscribe("chan").await.unwrap().unwrap();

        store.publish("chan", "hello").await.unwrap();

        assert_eq!(first.next().await, Some("hello".to_string()));
        assert_eq!(second.next().await, Some("hello".to_string()));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = InMemoryStore::new();
        store.set("k", "v", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
    }
}
