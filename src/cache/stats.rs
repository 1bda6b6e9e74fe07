//! Cache Statistics Module
//!
//! Tracks which tier answered each lookup, plus resident totals per tier.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::cache::CacheTier;

// == Cache Stats ==
/// Point-in-time snapshot of cache metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Lookups answered by the memory tier
    pub memory_hits: u64,
    /// Lookups answered by the disk tier
    pub disk_hits: u64,
    /// Lookups neither tier could answer
    pub misses: u64,
    /// Memory entries evicted by capacity or trimming
    pub evictions: u64,
    /// Current number of resident memory entries
    pub memory_entries: usize,
    /// Current total cost of resident memory entries
    pub memory_cost: u64,
    /// Records on disk according to the index
    pub disk_entries: usize,
    /// Payload bytes on disk according to the index
    pub disk_size: u64,
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the combined hit rate of both tiers.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no lookups have been made.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.disk_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

// == Lookup Counters ==
/// Lock-free lookup counters shared by every clone of a cache.
#[derive(Debug, Default)]
pub struct LookupCounters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
}

impl LookupCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one lookup answered by `tier`.
    pub fn record(&self, tier: CacheTier) {
        let counter = match tier {
            CacheTier::Memory => &self.memory_hits,
            CacheTier::Disk => &self.disk_hits,
            CacheTier::None => &self.misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Fills the lookup fields of `stats`.
    pub fn fill(&self, stats: &mut CacheStats) {
        stats.memory_hits = self.memory_hits.load(Ordering::Relaxed);
        stats.disk_hits = self.disk_hits.load(Ordering::Relaxed);
        stats.misses = self.misses.load(Ordering::Relaxed);
    }
}
