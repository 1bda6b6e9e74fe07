//! Memory Entry Module
//!
//! Defines a resident entry of the memory tier: the decoded value, its cost
//! and the access bookkeeping the LRU policy needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// == Memory Entry ==
/// Represents a single resident entry with its cost and access metadata.
///
/// Access fields are atomics so a read lock is enough to refresh them on a hit.
#[derive(Debug)]
pub struct MemoryEntry<V> {
    /// The stored value
    pub value: V,
    /// Memory footprint proxy (typically pixel count times bytes per pixel)
    pub cost: u64,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Logical access tick, strictly increasing across the store
    last_access: AtomicU64,
    /// Wall-clock time of the last access (Unix milliseconds)
    touched_at: AtomicU64,
}

impl<V> MemoryEntry<V> {
    // == Constructor ==
    /// Creates a new entry stamped with the given access tick.
    pub fn new(value: V, cost: u64, tick: u64) -> Self {
        let now = current_timestamp_ms();
        Self {
            value,
            cost,
            created_at: now,
            last_access: AtomicU64::new(tick),
            touched_at: AtomicU64::new(now),
        }
    }

    // == Touch ==
    /// Records an access at `tick`.
    pub fn touch(&self, tick: u64) {
        self.last_access.fetch_max(tick, Ordering::AcqRel);
        self.touched_at
            .store(current_timestamp_ms(), Ordering::Release);
    }

    /// Logical tick of the most recent access.
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    /// Milliseconds since the most recent access, relative to `now_ms`.
    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.touched_at.load(Ordering::Acquire))
    }

    #[cfg(test)]
    pub(crate) fn set_touched_at(&self, ms: u64) {
        self.touched_at.store(ms, Ordering::Release);
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
