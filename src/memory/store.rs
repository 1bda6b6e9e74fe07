//! Memory Store Module
//!
//! Bounded, cost-aware, thread-safe key to value table. Inserts that push the
//! store past its cost or count limit synchronously evict least recently used
//! entries until both limits hold again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::debug;

use crate::config::CacheConfig;
use crate::memory::{current_timestamp_ms, AccessClock, LruOrder, MemoryEntry};

// == Memory Limits ==
/// Capacity policy of a memory store. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryLimits {
    pub max_cost: Option<u64>,
    pub max_count: Option<usize>,
    pub max_age: Option<Duration>,
}

impl MemoryLimits {
    /// Extracts the memory limits from a cache config.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            max_cost: config.max_memory_cost,
            max_count: config.max_memory_count,
            max_age: config.max_memory_age,
        }
    }
}

#[derive(Debug)]
struct Inner<V> {
    entries: HashMap<String, MemoryEntry<V>>,
    /// Hits only hold the map's read lock, so the order has its own lock.
    /// Always taken after the map lock.
    order: Mutex<LruOrder>,
    total_cost: u64,
}

impl<V> Inner<V> {
    fn order(&self) -> MutexGuard<'_, LruOrder> {
        self.order.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn order_mut(&mut self) -> &mut LruOrder {
        self.order.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&mut self, key: String, entry: MemoryEntry<V>) {
        self.remove(&key);
        self.total_cost += entry.cost;
        self.order_mut().insert(entry.last_access(), key.clone());
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &str) -> Option<MemoryEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order_mut().remove(entry.last_access());
        self.total_cost -= entry.cost;
        Some(entry)
    }

    fn evict_while(&mut self, mut over: impl FnMut(&Self) -> bool) -> usize {
        let mut evicted = 0;
        while over(self) {
            let Some(key) = self.order_mut().oldest().map(str::to_string) else {
                break;
            };
            self.remove(&key);
            evicted += 1;
        }
        evicted
    }
}

// == Memory Store ==
/// Thread-safe LRU store with count, cost and age limits.
///
/// Lookups share a read lock and refresh access metadata atomically; every
/// mutation takes the write lock for its whole critical section.
#[derive(Debug)]
pub struct MemoryStore<V> {
    inner: RwLock<Inner<V>>,
    clock: AccessClock,
    limits: MemoryLimits,
    evictions: AtomicU64,
}

impl<V: Clone> MemoryStore<V> {
    // == Constructor ==
    /// Creates an empty store enforcing `limits`.
    pub fn new(limits: MemoryLimits) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                order: Mutex::new(LruOrder::new()),
                total_cost: 0,
            }),
            clock: AccessClock::new(),
            limits,
            evictions: AtomicU64::new(0),
        }
    }

    /// Limits this store was created with.
    pub fn limits(&self) -> MemoryLimits {
        self.limits
    }

    // == Put ==
    /// Inserts or replaces `key`, then evicts least recently used entries
    /// until both the cost and the count limit are satisfied.
    ///
    /// Returns the number of entries evicted. An entry whose own cost exceeds
    /// the cost limit is evicted as well, since it is then the last one left.
    pub fn put(&self, key: impl Into<String>, value: V, cost: u64) -> usize {
        let key = key.into();
        let entry = MemoryEntry::new(value, cost, self.clock.tick());

        let mut inner = self.write();
        inner.insert(key, entry);

        let evicted = inner.evict_while(|s| self.over_limits(s));
        drop(inner);
        self.record_evictions(evicted, "capacity");
        evicted
    }

    // == Get ==
    /// Returns a snapshot of the value and marks the entry as recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        let inner = self.read();
        let entry = inner.entries.get(key)?;
        {
            let mut order = inner.order();
            let tick = self.clock.tick();
            order.touch(entry.last_access(), tick);
            entry.touch(tick);
        }
        Some(entry.value.clone())
    }

    /// Presence check that does not count as an access.
    pub fn contains(&self, key: &str) -> bool {
        self.read().entries.contains_key(key)
    }

    // == Remove ==
    /// Removes `key`, returning its value if it was resident.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.write().remove(key).map(|entry| entry.value)
    }

    /// Drops every entry.
    pub fn remove_all(&self) {
        let mut inner = self.write();
        inner.entries.clear();
        inner.order_mut().clear();
        inner.total_cost = 0;
    }

    // == Trimming ==
    /// Evicts least recently used entries until total cost is at most `limit`.
    pub fn trim_to_cost(&self, limit: u64) -> usize {
        let evicted = self.write().evict_while(|s| s.total_cost > limit);
        self.record_evictions(evicted, "cost trim");
        evicted
    }

    /// Evicts least recently used entries until at most `limit` remain.
    pub fn trim_to_count(&self, limit: usize) -> usize {
        let evicted = self.write().evict_while(|s| s.entries.len() > limit);
        self.record_evictions(evicted, "count trim");
        evicted
    }

    /// Evicts every entry not accessed within `max_age`.
    pub fn trim_to_age(&self, max_age: Duration) -> usize {
        let now = current_timestamp_ms();
        let max_age_ms = max_age.as_millis() as u64;

        let mut inner = self.write();
        let stale: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.idle_ms(now) > max_age_ms)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            inner.remove(key);
        }
        drop(inner);

        self.record_evictions(stale.len(), "age trim");
        stale.len()
    }

    /// Applies every configured limit; used by the periodic trim task.
    pub fn trim(&self) -> usize {
        let mut evicted = 0;
        if let Some(max_age) = self.limits.max_age {
            evicted += self.trim_to_age(max_age);
        }
        if let Some(max_cost) = self.limits.max_cost {
            evicted += self.trim_to_cost(max_cost);
        }
        if let Some(max_count) = self.limits.max_count {
            evicted += self.trim_to_count(max_count);
        }
        evicted
    }

    // == Accounting ==
    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    /// Returns true if nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Sum of resident entry costs.
    pub fn total_cost(&self) -> u64 {
        self.read().total_cost
    }

    /// Entries evicted by capacity or trimming since creation.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn over_limits(&self, inner: &Inner<V>) -> bool {
        self.limits.max_cost.is_some_and(|max| inner.total_cost > max)
            || self
                .limits
                .max_count
                .is_some_and(|max| inner.entries.len() > max)
    }

    fn record_evictions(&self, count: usize, reason: &str) {
        if count > 0 {
            self.evictions.fetch_add(count as u64, Ordering::Relaxed);
            debug!("Memory tier evicted {} entries ({})", count, reason);
        }
    }

    // A panicking reader cannot leave the map half-updated, so a poisoned
    // lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, Inner<V>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<V>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_cost: Option<u64>, max_count: Option<usize>) -> MemoryStore<String> {
        MemoryStore::new(MemoryLimits {
            max_cost,
            max_count,
            max_age: None,
        })
    }

    #[test]
    fn test_store_new() {
        let store = store(None, None);
        assert_eq!(store.len(), 0);
        assert!(store.is_empty());
        assert_eq!(store.total_cost(), 0);
    }

    #[test]
    fn test_store_put_and_get() {
        let store = store(None, None);

        store.put("key1", "value1".to_string(), 10);

        assert_eq!(store.get("key1").as_deref(), Some("value1"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.total_cost(), 10);
    }

    #[test]
    fn test_store_get_nonexistent() {
        let store = store(None, None);
        assert_eq!(store.get("nonexistent"), None);
    }

    #[test]
    fn test_store_overwrite_replaces_cost() {
        let store = store(None, None);

        store.put("key1", "value1".to_string(), 10);
        store.put("key1", "value2".to_string(), 4);

        assert_eq!(store.get("key1").as_deref(), Some("value2"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.total_cost(), 4);
    }

    #[test]
    fn test_store_remove() {
        let store = store(None, None);

        store.put("key1", "value1".to_string(), 10);
        assert_eq!(store.remove("key1").as_deref(), Some("value1"));

        assert!(store.is_empty());
        assert_eq!(store.total_cost(), 0);
        assert_eq!(store.remove("key1"), None);
    }

    #[test]
    fn test_store_remove_all() {
        let store = store(None, None);

        store.put("a", "1".to_string(), 1);
        store.put("b", "2".to_string(), 2);
        store.remove_all();

        assert!(store.is_empty());
        assert_eq!(store.total_cost(), 0);
    }

    #[test]
    fn test_store_count_eviction() {
        let store = store(None, Some(3));

        store.put("key1", "value1".to_string(), 1);
        store.put("key2", "value2".to_string(), 1);
        store.put("key3", "value3".to_string(), 1);

        // Store is full, adding key4 should evict key1 (oldest)
        assert_eq!(store.put("key4", "value4".to_string(), 1), 1);

        assert_eq!(store.len(), 3);
        assert!(!store.contains("key1"));
        assert!(store.contains("key2"));
        assert!(store.contains("key4"));
        assert_eq!(store.evictions(), 1);
    }

    #[test]
    fn test_store_get_refreshes_recency() {
        let store = store(None, Some(3));

        store.put("key1", "value1".to_string(), 1);
        store.put("key2", "value2".to_string(), 1);
        store.put("key3", "value3".to_string(), 1);

        // Access key1 to make it most recently used
        store.get("key1");

        // Adding key4 should evict key2 (now oldest)
        store.put("key4", "value4".to_string(), 1);

        assert!(store.contains("key1"));
        assert!(!store.contains("key2"));
    }

    #[test]
    fn test_store_order_tracks_every_entry() {
        let store = store(None, Some(3));
        for key in ["a", "b", "c"] {
            store.put(key, key.to_string(), 1);
        }
        store.get("a");
        store.put("b", "b2".to_string(), 1);
        store.remove("c");
        store.put("d", "d".to_string(), 1);
        store.put("e", "e".to_string(), 1);

        let inner = store.read();
        let order: Vec<String> = inner.order().keys().map(str::to_string).collect();
        assert_eq!(order, vec!["b", "d", "e"]);
        assert_eq!(inner.order().len(), inner.entries.len());
    }

    #[test]
    fn test_store_cost_eviction_takes_several() {
        let store = store(Some(100), None);

        store.put("a", "a".to_string(), 40);
        store.put("b", "b".to_string(), 40);
        store.put("c", "c".to_string(), 20);

        // 170 > 100: a and b must both go
        assert_eq!(store.put("d", "d".to_string(), 70), 2);
        assert_eq!(store.total_cost(), 90);
        assert!(store.contains("c"));
        assert!(store.contains("d"));
    }

    #[test]
    fn test_store_oversized_entry_is_not_retained() {
        let store = store(Some(10), None);

        store.put("small", "s".to_string(), 5);
        store.put("huge", "h".to_string(), 50);

        assert!(store.is_empty());
        assert_eq!(store.total_cost(), 0);
    }

    #[test]
    fn test_store_trim_to_cost_and_count() {
        let store = store(None, None);
        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            store.put(*key, key.to_string(), (i as u64 + 1) * 10);
        }

        assert_eq!(store.trim_to_cost(70), 1);
        assert!(!store.contains("a"));

        assert_eq!(store.trim_to_count(1), 2);
        assert!(store.contains("d"));
    }

    #[test]
    fn test_store_trim_to_age() {
        let store = store(None, None);
        store.put("old", "o".to_string(), 1);
        store.put("fresh", "f".to_string(), 1);

        {
            let inner = store.read();
            inner.entries["old"].set_touched_at(current_timestamp_ms() - 60_000);
        }

        assert_eq!(store.trim_to_age(Duration::from_secs(30)), 1);
        assert!(!store.contains("old"));
        assert!(store.contains("fresh"));
    }

    #[test]
    fn test_store_trim_applies_configured_limits() {
        let store = store(None, None);
        for key in ["a", "b", "c"] {
            store.put(key, key.to_string(), 1);
        }
        // No limits configured, nothing to do
        assert_eq!(store.trim(), 0);

        let limited: MemoryStore<String> = MemoryStore::new(MemoryLimits {
            max_cost: None,
            max_count: Some(5),
            max_age: Some(Duration::from_secs(3600)),
        });
        limited.put("a", "a".to_string(), 1);
        assert_eq!(limited.trim(), 0);
        assert_eq!(limited.len(), 1);
    }
}
