//! Statistics counters
//!
//! Counters are plain atomics owned by each backend; callers only ever see
//! point-in-time snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time counters of a single backend
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Operations that failed or were short-circuited
    pub errors: u64,
}

impl CacheStatsSnapshot {
    /// Hit rate in percent, 0.0 when nothing was read yet
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Thread-safe counters backing [`CacheStatsSnapshot`]
#[derive(Debug, Default)]
pub struct AtomicCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub errors: AtomicU64,
}

impl AtomicCacheStats {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Coordinator statistics snapshot
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MultiLevelStats {
    pub total_requests: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    /// L2 hits copied into L1
    pub backfills: u64,
    /// `get_or_set` callers served by another caller's computation; counted
    /// as requests but neither hits nor misses
    pub coalesced: u64,
    pub sets: u64,
    pub deletes: u64,
    pub invalidations_published: u64,
    pub invalidations_received: u64,
    pub invalidations_applied: u64,
    /// Own echoes and malformed payloads
    pub invalidations_ignored: u64,
    pub listener_errors: u64,
    /// Percentage of requests served by either tier
    pub hit_rate: f64,
    /// Keys with a coalescing slot currently held
    pub in_flight: usize,
}

/// Thread-safe counters backing [`MultiLevelStats`]
#[derive(Debug, Default)]
pub(crate) struct AtomicMultiLevelStats {
    pub total_requests: AtomicU64,
    pub l1_hits: AtomicU64,
    pub l2_hits: AtomicU64,
    pub misses: AtomicU64,
    pub backfills: AtomicU64,
    pub coalesced: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub invalidations_published: AtomicU64,
    pub invalidations_received: AtomicU64,
    pub invalidations_applied: AtomicU64,
    pub invalidations_ignored: AtomicU64,
    pub listener_errors: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl AtomicMultiLevelStats {
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self, in_flight: usize) -> MultiLevelStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let l1_hits = self.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.l2_hits.load(Ordering::Relaxed);

        MultiLevelStats {
            total_requests,
            l1_hits,
            l2_hits,
            misses: self.misses.load(Ordering::Relaxed),
            backfills: self.backfills.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            invalidations_published: self.invalidations_published.load(Ordering::Relaxed),
            invalidations_received: self.invalidations_received.load(Ordering::Relaxed),
            invalidations_applied: self.invalidations_applied.load(Ordering::Relaxed),
            invalidations_ignored: self.invalidations_ignored.load(Ordering::Relaxed),
            listener_errors: self.listener_errors.load(Ordering::Relaxed),
            hit_rate: if total_requests > 0 {
                ((l1_hits + l2_hits) as f64 / total_requests as f64) * 100.0
            } else {
                0.0
            },
            in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_detached() {
        let stats = AtomicCacheStats::default();
        stats.hit();
        let before = stats.snapshot();
        stats.hit();
        stats.miss();

        assert_eq!(before.hits, 1);
        assert_eq!(before.misses, 0);
        assert_eq!(stats.snapshot().hits, 2);
    }

    #[test]
    fn test_hit_rate() {
        let stats = AtomicCacheStats::default();
        assert!(stats.snapshot().hit_rate().abs() < f64::EPSILON);
        stats.hit();
        stats.hit();
        stats.hit();
        stats.miss();
        assert!((stats.snapshot().hit_rate() - 75.0).abs() < f64::EPSILON);
    }
}
