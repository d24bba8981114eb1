//! Namespaced Cache - Key Prefixing Decorator
//!
//! Lets several logical tenants share one physical backend. The wrapped
//! backend only ever sees `"{namespace}{separator}{key}"`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{CacheError, CacheResult};
use crate::stats::CacheStatsSnapshot;
use crate::traits::CacheBackend;

pub const DEFAULT_SEPARATOR: &str = ":";

pub struct NamespacedCache {
    inner: Arc<dyn CacheBackend>,
    namespace: String,
    prefix: String,
    /// Prefix with glob metacharacters escaped, for scans
    scan_prefix: String,
}

impl NamespacedCache {
    /// Wrap `inner` under `namespace` with the default `:` separator
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidNamespace` if `namespace` is empty or whitespace.
    pub fn new(inner: Arc<dyn CacheBackend>, namespace: &str) -> CacheResult<Self> {
        Self::with_separator(inner, namespace, DEFAULT_SEPARATOR)
    }

    /// # Errors
    ///
    /// Returns `CacheError::InvalidNamespace` if `namespace` is empty or
    /// whitespace, or if `separator` is empty.
    pub fn with_separator(
        inner: Arc<dyn CacheBackend>,
        namespace: &str,
        separator: &str,
    ) -> CacheResult<Self> {
        if namespace.trim().is_empty() {
            return Err(CacheError::InvalidNamespace(
                "namespace must not be empty or whitespace".to_string(),
            ));
        }
        if separator.is_empty() {
            return Err(CacheError::InvalidNamespace(format!(
                "separator for namespace '{namespace}' must not be empty"
            )));
        }

        let prefix = format!("{namespace}{separator}");
        let scan_prefix = glob::Pattern::escape(&prefix);
        info!(namespace = %namespace, backend = inner.name(), "Initializing Namespaced Cache");

        Ok(Self {
            inner,
            namespace: namespace.to_string(),
            prefix,
            scan_prefix,
        })
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn inner(&self) -> &Arc<dyn CacheBackend> {
        &self.inner
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

#[async_trait]
impl CacheBackend for NamespacedCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(&self.full_key(key)).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        self.inner.set(&self.full_key(key), value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(&self.full_key(key)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(&self.full_key(key)).await
    }

    /// Deletes only keys under this namespace; other tenants are untouched
    async fn clear(&self) -> Result<bool> {
        let keys = self.inner.scan_keys(&format!("{}*", self.scan_prefix)).await?;
        let mut ok = true;
        for key in &keys {
            if let Err(e) = self.inner.delete(key).await {
                debug!(key = %key, error = %e, "Namespace clear failed to delete key");
                ok = false;
            }
        }
        info!(namespace = %self.namespace, count = keys.len(), "Cleared namespace");
        Ok(ok)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        crate::backends::compile_pattern(pattern)?;
        let keys = self
            .inner
            .scan_keys(&format!("{}{pattern}", self.scan_prefix))
            .await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }

    async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }

    fn name(&self) -> &'static str {
        "Namespaced"
    }

    fn stats(&self) -> CacheStatsSnapshot {
        self.inner.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryCache;
    use serde_json::json;

    #[test]
    fn test_rejects_blank_namespace() {
        let inner: Arc<dyn CacheBackend> = Arc::new(MemoryCache::default());
        assert!(matches!(
            NamespacedCache::new(Arc::clone(&inner), ""),
            Err(CacheError::InvalidNamespace(_))
        ));
        assert!(matches!(
            NamespacedCache::new(inner, "  \t"),
            Err(CacheError::InvalidNamespace(_))
        ));
    }

    #[tokio::test]
    async fn test_prefixes_keys() {
        let inner: Arc<dyn CacheBackend> = Arc::new(MemoryCache::default());
        let ns = NamespacedCache::new(Arc::clone(&inner), "svc").unwrap();

        ns.set("user:1", json!(1), None).await.unwrap();
        assert_eq!(inner.get("svc:user:1").await.unwrap(), Some(json!(1)));
        assert_eq!(ns.get("user:1").await.unwrap(), Some(json!(1)));
        assert_eq!(ns.scan_keys("user:*").await.unwrap(), vec!["user:1"]);
    }

    #[tokio::test]
    async fn test_glob_characters_in_namespace_are_literal() {
        let inner: Arc<dyn CacheBackend> = Arc::new(MemoryCache::default());
        let star = NamespacedCache::new(Arc::clone(&inner), "a*").unwrap();
        let plain = NamespacedCache::new(Arc::clone(&inner), "ab").unwrap();

        star.set("k", json!("star"), None).await.unwrap();
        plain.set("k", json!("plain"), None).await.unwrap();

        assert!(star.clear().await.unwrap());
        assert_eq!(plain.get("k").await.unwrap(), Some(json!("plain")));
        assert_eq!(star.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_custom_separator() {
        let inner: Arc<dyn CacheBackend> = Arc::new(MemoryCache::default());
        let ns = NamespacedCache::with_separator(Arc::clone(&inner), "svc", "/").unwrap();

        ns.set("k", json!(true), None).await.unwrap();
        assert!(inner.exists("svc/k").await.unwrap());
        assert!(NamespacedCache::with_separator(inner, "svc", "").is_err());
    }
}
