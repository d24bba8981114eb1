//! Eviction policies
//!
//! Pure bookkeeping of access order or frequency. A policy never touches the
//! stored values; it only names the key a storage engine should drop once an
//! insertion pushes it over capacity.

use std::collections::{BTreeMap, HashMap, HashSet};

use lru::LruCache;

/// Decides which key to evict
///
/// The storage engine reports every access, insertion and removal; the policy
/// answers insertions with an optional victim. The victim is never the key
/// being added.
pub trait EvictionPolicy: Send {
    /// A stored key was read or overwritten
    fn on_access(&mut self, key: &str);

    /// A new key was stored; returns the key to evict, if over capacity
    fn on_add(&mut self, key: &str) -> Option<String>;

    /// A key left the store (delete, expiry, eviction)
    fn on_remove(&mut self, key: &str);

    /// Forget every tracked key
    fn clear(&mut self);

    fn name(&self) -> &'static str;
}

/// Least-recently-used policy
pub struct LruPolicy {
    capacity: usize,
    order: LruCache<String, ()>,
}

impl LruPolicy {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: LruCache::unbounded(),
        }
    }
}

impl EvictionPolicy for LruPolicy {
    fn on_access(&mut self, key: &str) {
        self.order.promote(key);
    }

    fn on_add(&mut self, key: &str) -> Option<String> {
        self.order.put(key.to_string(), ());
        if self.order.len() > self.capacity {
            self.order.pop_lru().map(|(victim, ())| victim)
        } else {
            None
        }
    }

    fn on_remove(&mut self, key: &str) {
        self.order.pop(key);
    }

    fn clear(&mut self) {
        self.order.clear();
    }

    fn name(&self) -> &'static str {
        "lru"
    }
}

/// Least-frequently-used policy
///
/// Keys are grouped in frequency buckets so the lowest count is found without
/// scanning every key. Ties inside a bucket are broken arbitrarily.
pub struct LfuPolicy {
    capacity: usize,
    counts: HashMap<String, u64>,
    buckets: BTreeMap<u64, HashSet<String>>,
}

impl LfuPolicy {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            counts: HashMap::new(),
            buckets: BTreeMap::new(),
        }
    }

    /// Current access count of a key
    pub fn frequency(&self, key: &str) -> Option<u64> {
        self.counts.get(key).copied()
    }

    fn unlink(&mut self, key: &str, count: u64) {
        if let Some(bucket) = self.buckets.get_mut(&count) {
            bucket.remove(key);
            if bucket.is_empty() {
                self.buckets.remove(&count);
            }
        }
    }

    fn link(&mut self, key: &str, count: u64) {
        self.buckets
            .entry(count)
            .or_default()
            .insert(key.to_string());
    }

    fn pick_victim(&self, protected: &str) -> Option<String> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.iter())
            .find(|candidate| candidate.as_str() != protected)
            .cloned()
    }
}

impl EvictionPolicy for LfuPolicy {
    fn on_access(&mut self, key: &str) {
        let Some(count) = self.counts.get_mut(key) else {
            return;
        };
        let old = *count;
        *count += 1;
        self.unlink(key, old);
        self.link(key, old + 1);
    }

    fn on_add(&mut self, key: &str) -> Option<String> {
        if self.counts.contains_key(key) {
            self.on_access(key);
            return None;
        }

        self.counts.insert(key.to_string(), 1);
        self.link(key, 1);

        if self.counts.len() <= self.capacity {
            return None;
        }

        let victim = self.pick_victim(key)?;
        self.on_remove(&victim);
        Some(victim)
    }

    fn on_remove(&mut self, key: &str) {
        if let Some(count) = self.counts.remove(key) {
            self.unlink(key, count);
        }
    }

    fn clear(&mut self) {
        self.counts.clear();
        self.buckets.clear();
    }

    fn name(&self) -> &'static str {
        "lfu"
    }
}
