//! Memory Tier
//!
//! Provides the in-memory store: cost-aware LRU eviction with optional age
//! trimming, safe to share across threads.

mod entry;
mod lru;
mod store;


// Re-export public types
pub use entry::{current_timestamp_ms, MemoryEntry};
pub use lru::{AccessClock, LruOrder};
pub use store::{MemoryLimits, MemoryStore};
