//! Integration tests for basic cache operations
//!
//! Tests round trips, expiry, eviction and the read/write paths of the coordinator

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use multi_level_cache::{
    CacheBackend, InMemoryStore, MemoryCache, MemoryCacheConfig, MultiLevelConfig, RemoteStore,
    StrategicMemoryCache,
};
use serde_json::json;

#[tokio::test]
async fn test_set_then_get_round_trip() {
    let store = InMemoryStore::new();
    let node = node(&store, "node-a").await;
    let key = test_key("round_trip");
    let value = test_data::json_user(1);

    assert!(node.cache.set(&key, value.clone(), Some(Duration::from_secs(60))).await.unwrap());
    assert_eq!(node.cache.get(&key).await.unwrap(), Some(value.clone()));

    // Both tiers hold the value
    assert_eq!(node.l1.get(&key).await.unwrap(), Some(value.clone()));
    assert_eq!(node.l2.get(&key).await.unwrap(), Some(value));

    let stats = node.cache.get_stats();
    assert_eq!(stats.l1_hits, 1);
    assert_eq!(stats.sets, 1);
    node.cache.close().await;
}

#[tokio::test]
async fn test_value_expires_after_ttl() {
    let store = InMemoryStore::new();
    let node = node(&store, "node-a").await;
    let key = test_key("expiry");

    node.cache
        .set(&key, json!("short-lived"), Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(node.cache.exists(&key).await.unwrap());

    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(node.cache.get(&key).await.unwrap(), None);
    assert!(!node.cache.exists(&key).await.unwrap());
    node.cache.close().await;
}

#[tokio::test]
async fn test_l1_lru_eviction() {
    let l1 = MemoryCache::new(MemoryCacheConfig {
        max_size: 2,
        default_ttl: Duration::from_secs(60),
    });

    l1.set("A", json!("a"), None).await.unwrap();
    l1.set("B", json!("b"), None).await.unwrap();
    l1.get("A").await.unwrap();
    l1.set("C", json!("c"), None).await.unwrap();

    assert!(l1.exists("A").await.unwrap());
    assert!(!l1.exists("B").await.unwrap());
    assert!(l1.exists("C").await.unwrap());
    assert_eq!(l1.stats().evictions, 1);
}

#[tokio::test]
async fn test_strategic_lfu_eviction() {
    let cache = StrategicMemoryCache::with_lfu(2, Duration::from_secs(60));

    cache.set("A", json!(1), None).await.unwrap();
    cache.set("B", json!(2), None).await.unwrap();
    cache.get("A").await.unwrap();
    cache.get("A").await.unwrap();
    cache.get("B").await.unwrap();
    cache.set("C", json!(3), None).await.unwrap();

    assert!(cache.exists("A").await.unwrap());
    assert!(!cache.exists("B").await.unwrap());
    assert!(cache.exists("C").await.unwrap());
}

#[tokio::test]
async fn test_l2_hit_backfills_l1() {
    let store = InMemoryStore::new();
    let node = node(&store, "node-a").await;
    let key = test_key("backfill");

    // Written by "someone else" straight into the shared store
    store
        .set(&key, r#"{"from":"l2"}"#, Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(node.cache.get(&key).await.unwrap(), Some(json!({"from": "l2"})));
    assert_eq!(node.l1.get(&key).await.unwrap(), Some(json!({"from": "l2"})));

    let stats = node.cache.get_stats();
    assert_eq!(stats.l2_hits, 1);
    assert_eq!(stats.backfills, 1);
    node.cache.close().await;
}

#[tokio::test]
async fn test_backfill_disabled_leaves_l1_empty() {
    let store = InMemoryStore::new();
    let node = node_with(
        Arc::new(store.clone()),
        "node-a",
        MultiLevelConfig {
            sync_l1: false,
            ..MultiLevelConfig::default()
        },
    )
    .await;
    let key = test_key("no_backfill");
    store.set(&key, "1", Duration::from_secs(60)).await.unwrap();

    assert_eq!(node.cache.get(&key).await.unwrap(), Some(json!(1)));
    assert_eq!(node.l1.get(&key).await.unwrap(), None);
    node.cache.close().await;
}

#[tokio::test]
async fn test_delete_removes_from_both_tiers() {
    let store = InMemoryStore::new();
    let node = node(&store, "node-a").await;
    let key = test_key("delete");

    node.cache.set(&key, json!(1), None).await.unwrap();
    assert!(node.cache.delete(&key).await.unwrap());
    assert!(!node.cache.delete(&key).await.unwrap());

    assert!(!node.l1.exists(&key).await.unwrap());
    assert!(!store.exists(&key).await.unwrap());
    node.cache.close().await;
}

#[tokio::test]
async fn test_scan_keys_unions_tiers() {
    let store = InMemoryStore::new();
    let node = node(&store, "node-a").await;

    node.cache.set("user:1", json!(1), None).await.unwrap();
    node.l1.set("user:2", json!(2), None).await.unwrap();
    store.set("user:3", "3", Duration::from_secs(60)).await.unwrap();
    store.set("order:1", "1", Duration::from_secs(60)).await.unwrap();

    let mut keys = node.cache.scan_keys("user:*").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["user:1", "user:2", "user:3"]);

    assert!(node.cache.scan_keys("[").await.is_err());
    node.cache.close().await;
}

#[tokio::test]
async fn test_clear_empties_both_tiers_without_publishing() {
    let store = InMemoryStore::new();
    let node = node(&store, "node-a").await;

    node.cache.set("a", json!(1), None).await.unwrap();
    node.cache.set("b", json!(2), None).await.unwrap();
    let published = node.cache.get_stats().invalidations_published;

    assert!(node.cache.clear().await.unwrap());
    assert!(node.l1.is_empty());
    assert!(store.is_empty());
    assert_eq!(node.cache.get_stats().invalidations_published, published);
    node.cache.close().await;
}

#[tokio::test]
async fn test_non_json_value_in_l2_reads_as_string() {
    let store = InMemoryStore::new();
    let node = node(&store, "node-a").await;
    store
        .set("legacy", "plain text payload", Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(
        node.cache.get("legacy").await.unwrap(),
        Some(json!("plain text payload"))
    );
    node.cache.close().await;
}
