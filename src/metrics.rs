//! Cache operation counters.
//!
//! Counters are plain atomics updated outside the cache mutex, so recording
//! never extends a critical section. Snapshots are rendered into a
//! `BTreeMap` rather than a hash map: deterministic key ordering keeps test
//! assertions, logs, and exported reports stable across runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for one cache instance.
///
/// A snapshot is not atomic across counters; under concurrent traffic the
/// individual values may be skewed by in-flight operations.
#[derive(Debug, Default)]
pub struct CacheCounters {
    /// Read requests (`get_or_compute*` calls).
    requests: AtomicU64,
    /// Requests answered from a fresh READY entry.
    hits: AtomicU64,
    /// Requests answered from a fresh FAILED entry.
    negative_hits: AtomicU64,
    /// Requests that blocked behind another thread's in-flight computation.
    coalesced_waits: AtomicU64,
    /// Miss handler invocations that succeeded.
    computes: AtomicU64,
    /// Miss handler invocations that failed, including codec failures.
    compute_failures: AtomicU64,
    /// Entries stored via `insert`.
    insertions: AtomicU64,
    /// Entries discarded to make room for a new key.
    evictions: AtomicU64,
    /// Entries purged or reset after their TTL lapsed.
    expirations: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_negative_hit(&self) {
        self.negative_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced_wait(&self) {
        self.coalesced_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compute(&self) {
        self.computes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compute_failure(&self) {
        self.compute_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_insertion(&self) {
        self.insertions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    /// Renders all counters, plus the derived `hit_rate`, in deterministic
    /// order.
    pub fn to_btreemap(&self) -> BTreeMap<String, f64> {
        let requests = self.requests.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);

        let mut metrics = BTreeMap::new();
        metrics.insert("requests".to_string(), requests as f64);
        metrics.insert("hits".to_string(), hits as f64);
        metrics.insert(
            "negative_hits".to_string(),
            self.negative_hits.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "coalesced_waits".to_string(),
            self.coalesced_waits.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "computes".to_string(),
            self.computes.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "compute_failures".to_string(),
            self.compute_failures.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "insertions".to_string(),
            self.insertions.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "evictions".to_string(),
            self.evictions.load(Ordering::Relaxed) as f64,
        );
        metrics.insert(
            "expirations".to_string(),
            self.expirations.load(Ordering::Relaxed) as f64,
        );

        if requests > 0 {
            metrics.insert("hit_rate".to_string(), hits as f64 / requests as f64);
        }

        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let counters = CacheCounters::default();
        let snapshot = counters.to_btreemap();
        assert_eq!(snapshot.get("requests"), Some(&0.0));
        assert_eq!(snapshot.get("hits"), Some(&0.0));
        assert_eq!(snapshot.get("evictions"), Some(&0.0));
        // No requests yet, so no hit rate.
        assert!(!snapshot.contains_key("hit_rate"));
    }

    #[test]
    fn test_recording_and_hit_rate() {
        let counters = CacheCounters::default();
        counters.record_request();
        counters.record_request();
        counters.record_request();
        counters.record_request();
        counters.record_hit();
        counters.record_hit();
        counters.record_hit();
        counters.record_compute();
        counters.record_eviction();

        let snapshot = counters.to_btreemap();
        assert_eq!(snapshot.get("requests"), Some(&4.0));
        assert_eq!(snapshot.get("hits"), Some(&3.0));
        assert_eq!(snapshot.get("computes"), Some(&1.0));
        assert_eq!(snapshot.get("evictions"), Some(&1.0));
        assert_eq!(snapshot.get("hit_rate"), Some(&0.75));
    }

    #[test]
    fn test_snapshot_key_order_is_stable() {
        let counters = CacheCounters::default();
        let keys: Vec<_> = counters.to_btreemap().into_keys().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
