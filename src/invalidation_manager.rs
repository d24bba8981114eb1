//! Bulk invalidation by glob pattern and by tag
//!
//! Tag membership lives in the cache itself: `tag:<name>` holds a JSON array
//! of member keys. No separate index store is involved.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::traits::CacheBackend;

const TAG_PREFIX: &str = "tag:";

/// Pattern- and tag-based invalidation over any backend
pub struct InvalidationManager {
    cache: Arc<dyn CacheBackend>,
    /// Serializes read-modify-write of tag sets within this process
    tag_lock: Mutex<()>,
}

impl InvalidationManager {
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self {
            cache,
            tag_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn tag_key(tag: &str) -> String {
        format!("{TAG_PREFIX}{tag}")
    }

    /// Delete every key matching `pattern`; returns how many were removed
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern is not a valid glob.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let keys = self.cache.scan_keys(pattern).await?;
        let deleted = self.invalidate_keys(&keys).await?;
        info!(pattern = %pattern, matched = keys.len(), deleted, "Invalidated keys by pattern");
        Ok(deleted)
    }

    /// Delete each key; returns how many were actually present
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub async fn invalidate_keys<S: AsRef<str>>(&self, keys: &[S]) -> Result<usize> {
        let mut deleted = 0;
        for key in keys {
            if self.cache.delete(key.as_ref()).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Record `key` as a member of every tag in `tags`
    ///
    /// Adding a key to a tag it already belongs to is a no-op. `ttl` applies to
    /// the tag set entries; `None` uses the backend default.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub async fn add_tags(&self, key: &str, tags: &[&str], ttl: Option<Duration>) -> Result<()> {
        let _guard = self.tag_lock.lock().await;

        for tag in tags {
            let tag_key = Self::tag_key(tag);
            let mut members = self.read_members(&tag_key).await?;
            if members.iter().any(|member| member == key) {
                continue;
            }
            members.push(key.to_string());

            if !self.cache.set(&tag_key, Value::from(members), ttl).await? {
                warn!(tag = %tag, key = %key, "Tag set not stored, backend unavailable");
            }
            debug!(tag = %tag, key = %key, "Tagged key");
        }
        Ok(())
    }

    /// Current member keys of `tag`
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub async fn tag_members(&self, tag: &str) -> Result<Vec<String>> {
        self.read_members(&Self::tag_key(tag)).await
    }

    /// Delete every member of `tag`, then the tag set itself
    ///
    /// Returns the number of member keys that were deleted. A tag with no
    /// members returns 0.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub async fn invalidate_tag(&self, tag: &str) -> Result<usize> {
        let _guard = self.tag_lock.lock().await;

        let tag_key = Self::tag_key(tag);
        let members = self.read_members(&tag_key).await?;
        if members.is_empty() {
            return Ok(0);
        }

        let deleted = self.invalidate_keys(&members).await?;
        self.cache.delete(&tag_key).await?;

        info!(tag = %tag, members = members.len(), deleted, "Invalidated keys by tag");
        Ok(deleted)
    }

    async fn read_members(&self, tag_key: &str) -> Result<Vec<String>> {
        let Some(raw) = self.cache.get(tag_key).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_value(raw) {
            Ok(members) => Ok(members),
            Err(e) => {
                warn!(tag_key = %tag_key, error = %e, "Tag set is not a list of keys, treating as empty");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryCache;
    use serde_json::json;

    fn manager() -> (Arc<dyn CacheBackend>, InvalidationManager) {
        let cache: Arc<dyn CacheBackend> = Arc::new(MemoryCache::default());
        (Arc::clone(&cache), InvalidationManager::new(cache))
    }

    #[tokio::test]
    async fn test_add_tags_is_idempotent() {
        let (_, manager) = manager();
        manager.add_tags("a", &["t"], None).await.unwrap();
        manager.add_tags("a", &["t"], None).await.unwrap();
        manager.add_tags("b", &["t"], None).await.unwrap();

        assert_eq!(manager.tag_members("t").await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unknown_tag_is_noop() {
        let (_, manager) = manager();
        assert_eq!(manager.invalidate_tag("nothing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_pattern_counts_deleted() {
        let (cache, manager) = manager();
        for key in ["user:1", "user:2", "order:1"] {
            cache.set(key, json!(key), None).await.unwrap();
        }

        assert_eq!(manager.invalidate_pattern("user:*").await.unwrap(), 2);
        assert!(cache.exists("order:1").await.unwrap());
        assert!(!cache.exists("user:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_tag_set_reads_empty() {
        let (cache, manager) = manager();
        cache.set("tag:bad", json!("oops"), None).await.unwrap();
        assert!(manager.tag_members("bad").await.unwrap().is_empty());
    }
}
