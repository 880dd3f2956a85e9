//! Pipeline Metrics Collection
//!
//! Counters for tier hits, load coalescing, replication and eviction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::domain::ports::Tier;

/// Pipeline metrics collector
#[derive(Debug, Default)]
pub struct TierMetrics {
    // Lookups per tier
    local_hits: AtomicU64,
    local_misses: AtomicU64,
    distributed_hits: AtomicU64,
    distributed_misses: AtomicU64,
    backing_hits: AtomicU64,
    backing_misses: AtomicU64,

    // Loads
    loads_started: AtomicU64,
    loads_joined: AtomicU64,
    loads_failed: AtomicU64,
    load_latency_us: AtomicU64,

    // Replication
    replication_merged: AtomicU64,
    replication_buffered: AtomicU64,
    replication_ignored: AtomicU64,
    replication_dropped: AtomicU64,
    replication_removals: AtomicU64,

    // Saves
    saves: AtomicU64,
    saves_rejected: AtomicU64,
    sync_failures: AtomicU64,

    // Sweeper
    evictions: AtomicU64,
    eviction_failures: AtomicU64,
}

impl TierMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, tier: Tier) {
        let counter = match tier {
            Tier::Local => &self.local_hits,
            Tier::Distributed => &self.distributed_hits,
            Tier::Backing => &self.backing_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self, tier: Tier) {
        let counter = match tier {
            Tier::Local => &self.local_misses,
            Tier::Distributed => &self.distributed_misses,
            Tier::Backing => &self.backing_misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_started(&self) {
        self.loads_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_joined(&self) {
        self.loads_joined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_failed(&self) {
        self.loads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = self.load_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .load_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn record_replication_merged(&self) {
        self.replication_merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replication_buffered(&self) {
        self.replication_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replication_ignored(&self) {
        self.replication_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replication_dropped(&self) {
        self.replication_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replication_removal(&self) {
        self.replication_removals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_save(&self) {
        self.saves.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_save_rejected(&self) {
        self.saves_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_failure(&self) {
        self.sync_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction_failure(&self) {
        self.eviction_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn local_hit_ratio(&self) -> f64 {
        let hits = self.local_hits.load(Ordering::Relaxed) as f64;
        let total = hits + self.local_misses.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn load_latency(&self) -> Duration {
        Duration::from_micros(self.load_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            local_hits: load(&self.local_hits),
            local_misses: load(&self.local_misses),
            local_hit_ratio: self.local_hit_ratio(),
            distributed_hits: load(&self.distributed_hits),
            distributed_misses: load(&self.distributed_misses),
            backing_hits: load(&self.backing_hits),
            backing_misses: load(&self.backing_misses),

            loads_started: load(&self.loads_started),
            loads_joined: load(&self.loads_joined),
            loads_failed: load(&self.loads_failed),
            load_latency_us: load(&self.load_latency_us),

            replication_merged: load(&self.replication_merged),
            replication_buffered: load(&self.replication_buffered),
            replication_ignored: load(&self.replication_ignored),
            replication_dropped: load(&self.replication_dropped),
            replication_removals: load(&self.replication_removals),

            saves: load(&self.saves),
            saves_rejected: load(&self.saves_rejected),
            sync_failures: load(&self.sync_failures),

            evictions: load(&self.evictions),
            eviction_failures: load(&self.eviction_failures),
        }
    }
}

/// Snapshot of all pipeline metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub local_hits: u64,
    pub local_misses: u64,
    pub local_hit_ratio: f64,
    pub distributed_hits: u64,
    pub distributed_misses: u64,
    pub backing_hits: u64,
    pub backing_misses: u64,

    pub loads_started: u64,
    pub loads_joined: u64,
    pub loads_failed: u64,
    pub load_latency_us: u64,

    pub replication_merged: u64,
    pub replication_buffered: u64,
    pub replication_ignored: u64,
    pub replication_dropped: u64,
    pub replication_removals: u64,

    pub saves: u64,
    pub saves_rejected: u64,
    pub sync_failures: u64,

    pub evictions: u64,
    pub eviction_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let metrics = TierMetrics::new();
        assert_eq!(metrics.local_hit_ratio(), 0.0);

        metrics.record_hit(Tier::Local);
        metrics.record_hit(Tier::Local);
        metrics.record_hit(Tier::Local);
        metrics.record_miss(Tier::Local);
        assert!((metrics.local_hit_ratio() - 0.75).abs() < 0.001);
    }

    #[test]
    fn test_latency_ema() {
        let metrics = TierMetrics::new();
        metrics.record_load_latency(Duration::from_micros(100));
        assert_eq!(metrics.load_latency(), Duration::from_micros(100));

        metrics.record_load_latency(Duration::from_micros(200));
        let latency = metrics.load_latency().as_micros();
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_snapshot() {
        let metrics = TierMetrics::new();
        metrics.record_miss(Tier::Distributed);
        metrics.record_hit(Tier::Backing);
        metrics.record_load_started();
        metrics.record_load_joined();
        metrics.record_eviction();

        let snap = metrics.snapshot();
        assert_eq!(snap.distributed_misses, 1);
        assert_eq!(snap.backing_hits, 1);
        assert_eq!(snap.loads_started, 1);
        assert_eq!(snap.loads_joined, 1);
        assert_eq!(snap.evictions, 1);
    }
}
