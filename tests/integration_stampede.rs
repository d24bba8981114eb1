//! Integration tests for stampede protection
//!
//! Tests concurrent access patterns and request coalescing

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::*;
use multi_level_cache::{CacheBackend, CacheError, InMemoryStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinSet;

/// Test stampede protection with concurrent requests
#[tokio::test]
async fn test_concurrent_cache_miss() {
    let store = InMemoryStore::new();
    let node = node(&store, "node-a").await;
    let key = test_key("stampede");
    let compute_count = Arc::new(AtomicU32::new(0));

    // Spawn 100 concurrent requests for same key
    let mut tasks = JoinSet::new();
    for _ in 0..100 {
        let cache = Arc::clone(&node.cache);
        let key = key.clone();
        let counter = Arc::clone(&compute_count);

        tasks.spawn(async move {
            cache
                .get_or_set(
                    &key,
                    || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        Ok(json!({"computed": n}))
                    },
                    None,
                )
                .await
        });
    }

    let mut results = Vec::new();
    while let Some(result) = tasks.join_next().await {
        results.push(
            result
                .unwrap_or_else(|_| panic!("Task panicked"))
                .unwrap_or_else(|_| panic!("Compute failed")),
        );
    }

    // Stampede protection: only ONE compute should have happened
    let compute_calls = compute_count.load(Ordering::SeqCst);
    assert_eq!(compute_calls, 1, "Expected exactly 1 compute call, got {compute_calls}");
    assert_eq!(results.len(), 100);
    assert!(results.iter().all(|value| *value == json!({"computed": 1})));

    // Slot released once everyone is served
    assert_eq!(node.cache.get_stats().in_flight, 0);
    node.cache.close().await;
}

#[tokio::test]
async fn test_cold_get_or_set_counts_one_request() {
    let store = InMemoryStore::new();
    let node = node(&store, "node-a").await;

    node.cache
        .get_or_set("k", || async { Ok(json!("v")) }, None)
        .await
        .unwrap();

    let stats = node.cache.get_stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.l1_hits, 0);
    assert_eq!(stats.l2_hits, 0);
    assert_eq!(stats.coalesced, 0);

    // Second call is a plain L1 hit
    node.cache
        .get_or_set("k", || async { Ok(json!("other")) }, None)
        .await
        .unwrap();
    let stats = node.cache.get_stats();
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.l1_hits, 1);
    node.cache.close().await;
}

#[tokio::test]
async fn test_coalesced_callers_count_once_each() {
    let store = InMemoryStore::new();
    let node = node(&store, "node-a").await;

    let mut tasks = JoinSet::new();
    for _ in 0..50 {
        let cache = Arc::clone(&node.cache);
        tasks.spawn(async move {
            cache
                .get_or_set(
                    "shared",
                    || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!(1))
                    },
                    None,
                )
                .await
        });
    }
    while let Some(result) = tasks.join_next().await {
        result
            .unwrap_or_else(|_| panic!("Task panicked"))
            .unwrap_or_else(|_| panic!("Compute failed"));
    }

    let stats = node.cache.get_stats();
    assert_eq!(stats.total_requests, 50);
    assert_eq!(stats.misses, 1, "only the caller that ran the factory missed");
    assert_eq!(stats.l1_hits + stats.l2_hits + stats.coalesced, 49);
    node.cache.close().await;
}

/// Waiters receive the winner's value even when storing it failed
#[tokio::test]
async fn test_waiters_share_value_when_l2_write_fails() {
    let store = Arc::new(FlakyStore::default());
    let node = node_with(Arc::clone(&store) as _, "node-a", Default::default()).await;
    store.set_down(true);
    let compute_count = Arc::new(AtomicU32::new(0));

    let mut tasks = JoinSet::new();
    for _ in 0..20 {
        let cache = Arc::clone(&node.cache);
        let counter = Arc::clone(&compute_count);
        tasks.spawn(async move {
            cache
                .get_or_set(
                    "uncacheable",
                    || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(json!("fresh"))
                    },
                    None,
                )
                .await
        });
    }

    while let Some(result) = tasks.join_next().await {
        let value = result
            .unwrap_or_else(|_| panic!("Task panicked"))
            .unwrap_or_else(|_| panic!("Compute failed"));
        assert_eq!(value, json!("fresh"));
    }

    assert_eq!(compute_count.load(Ordering::SeqCst), 1);
    // Nothing reached either tier
    assert!(!node.l1.exists("uncacheable").await.unwrap());
    node.cache.close().await;
}

#[tokio::test]
async fn test_get_or_set_returns_cached_without_computing() {
    let store = InMemoryStore::new();
    let node = node(&store, "node-a").await;
    node.cache.set("present", json!(42), None).await.unwrap();

    let value = node
        .cache
        .get_or_set(
            "present",
            || async { Err(anyhow::anyhow!("factory must not run for a cached key")) },
            None,
        )
        .await
        .unwrap();

    assert_eq!(value, json!(42));
    node.cache.close().await;
}

#[tokio::test]
async fn test_factory_error_propagates_and_is_not_cached() {
    let store = InMemoryStore::new();
    let node = node(&store, "node-a").await;

    let result = node
        .cache
        .get_or_set("broken", || async { anyhow::bail!("upstream down") }, None)
        .await;
    assert!(result.is_err());
    assert!(!node.cache.exists("broken").await.unwrap());

    // A later caller computes afresh
    let value = node
        .cache
        .get_or_set("broken", || async { Ok(json!("recovered")) }, None)
        .await
        .unwrap();
    assert_eq!(value, json!("recovered"));
    assert_eq!(node.cache.get_stats().in_flight, 0);
    node.cache.close().await;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Product {
    id: u64,
    name: String,
}

#[tokio::test]
async fn test_typed_get_or_set() {
    let store = InMemoryStore::new();
    let node = node(&store, "node-a").await;
    let product = Product {
        id: 7,
        name: "lamp".to_string(),
    };

    let expected = product.clone();
    let computed: Product = node
        .cache
        .get_or_set_typed("product:7", || async move { Ok(expected) }, None)
        .await
        .unwrap();
    assert_eq!(computed, product);

    // Stored as plain JSON
    assert_eq!(
        node.cache.get("product:7").await.unwrap(),
        Some(json!({"id": 7, "name": "lamp"}))
    );

    // A value of the wrong shape is replaced
    node.cache.set("product:8", json!("garbage"), None).await.unwrap();
    let replaced: Product = node
        .cache
        .get_or_set_typed(
            "product:8",
            || async {
                Ok(Product {
                    id: 8,
                    name: "desk".to_string(),
                })
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(replaced.id, 8);
    node.cache.close().await;
}

#[tokio::test]
async fn test_typed_serialization_failure_is_reported() {
    let store = InMemoryStore::new();
    let node = node(&store, "node-a").await;

    // Tuple keys have no JSON object representation
    let result: anyhow::Result<HashMap<(u32, u32), u32>> = node
        .cache
        .get_or_set_typed(
            "grid",
            || async { Ok(HashMap::from([((1, 2), 3)])) },
            None,
        )
        .await;

    let err = result.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CacheError>(),
        Some(CacheError::Serialization(_))
    ));
    assert!(!node.cache.exists("grid").await.unwrap());
    node.cache.close().await;
}
