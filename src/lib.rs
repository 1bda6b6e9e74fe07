//! Image Cache - a two-tier cache for decoded images
//!
//! A cost-aware LRU memory store in front of a durable, prunable disk store,
//! addressed by opaque string keys (usually URLs).

pub mod cache;
pub mod config;
pub mod disk;
pub mod error;
pub mod memory;
pub mod tasks;

pub use cache::{
    BytesCodec, CacheStats, CacheTier, ImageCache, ImageCodec, ImageFormat, Lookup, QueryHandle,
    StoreRequest, StoreTargets,
};
pub use config::CacheConfig;
pub use disk::Pending;
pub use error::{CacheError, Result};
pub use tasks::spawn_maintenance_tasks;
