//! Cache metrics.
//!
//! Counters live in the process (for the on-demand [`MetricsSnapshot`]) and
//! are mirrored to the `metrics` facade so an installed exporter sees them.

use metrics::{counter, gauge};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "examgate_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "examgate_cache_misses_total";
    pub const CACHE_SETS_TOTAL: &str = "examgate_cache_sets_total";
    pub const CACHE_DELETES_TOTAL: &str = "examgate_cache_deletes_total";
    pub const CACHE_REMOTE_ERRORS_TOTAL: &str = "examgate_cache_remote_errors_total";
    pub const CACHE_ENTRIES: &str = "examgate_cache_entries";
}

/// Which tier served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    Remote,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Local => "L1",
            Tier::Remote => "L2",
        }
    }
}

#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, tier: Tier) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_HITS_TOTAL, "tier" => tier.as_str()).increment(1);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_MISSES_TOTAL).increment(1);
    }

    pub fn record_set(&self, local_entries: usize) {
        counter!(names::CACHE_SETS_TOTAL).increment(1);
        gauge!(names::CACHE_ENTRIES, "tier" => Tier::Local.as_str()).set(local_entries as f64);
    }

    pub fn record_delete(&self, removed: u64, local_entries: usize) {
        counter!(names::CACHE_DELETES_TOTAL).increment(removed);
        gauge!(names::CACHE_ENTRIES, "tier" => Tier::Local.as_str()).set(local_entries as f64);
    }

    pub fn record_remote_error(&self, op: &'static str) {
        counter!(names::CACHE_REMOTE_ERRORS_TOTAL, "op" => op).increment(1);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Zero the hit and miss counters (operator action).
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self, tracked_entries: usize, approx_memory_bytes: u64) -> MetricsSnapshot {
        let hits = self.hits();
        let misses = self.misses();
        MetricsSnapshot {
            hits,
            misses,
            hit_rate: hit_rate(hits, misses),
            tracked_entries,
            approx_memory_bytes,
        }
    }
}

/// Point-in-time view for health and metrics endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Percentage of lookups served from either tier.
    pub hit_rate: f64,
    pub tracked_entries: usize,
    pub approx_memory_bytes: u64,
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        (hits as f64 / total as f64) * 100.0
    }
}
