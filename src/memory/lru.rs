//! LRU Ordering Module
//!
//! Implements Least Recently Used ordering for memory eviction.
//!
//! Every insert and every hit draws a fresh tick from a shared counter, so
//! ticks are unique: an entry inserted earlier and never read again always
//! sorts before one inserted later, which gives insertion-order tie breaking
//! for free.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

// == Access Clock ==
/// Monotonic source of access ticks.
#[derive(Debug, Default)]
pub struct AccessClock {
    next: AtomicU64,
}

impl AccessClock {
    // == Constructor ==
    /// Creates a new clock starting at zero.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    // == Tick ==
    /// Returns a tick greater than every tick handed out before.
    pub fn tick(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }
}

// == LRU Order ==
/// Keys indexed by their latest access tick, least recently used first.
#[derive(Debug, Default)]
pub struct LruOrder {
    by_tick: BTreeMap<u64, String>,
}

impl LruOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key` as accessed at `tick`.
    pub fn insert(&mut self, tick: u64, key: String) {
        self.by_tick.insert(tick, key);
    }

    /// Forgets the key accessed at `tick`.
    pub fn remove(&mut self, tick: u64) -> Option<String> {
        self.by_tick.remove(&tick)
    }

    /// Moves the key last seen at `old` to `new`.
    pub fn touch(&mut self, old: u64, new: u64) {
        if let Some(key) = self.by_tick.remove(&old) {
            self.by_tick.insert(new, key);
        }
    }

    /// Least recently used key.
    pub fn oldest(&self) -> Option<&str> {
        self.by_tick.values().next().map(String::as_str)
    }

    /// Keys from least to most recently used.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.by_tick.values().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.by_tick.clear();
    }

    pub fn len(&self) -> usize {
        self.by_tick.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tick.is_empty()
    }
}
