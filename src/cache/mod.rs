//! Cache Module
//!
//! The coordinator that composes the memory and disk tiers, the producer
//! boundary types it consumes, and the handles and statistics it returns.

mod coordinator;
mod format;
mod handle;
mod stats;

// Re-export public types
pub use coordinator::{CacheTier, ImageCache, Lookup};
pub use format::{BytesCodec, EncodeTarget, ImageCodec, ImageFormat, StoreRequest, StoreTargets};
pub use handle::QueryHandle;
pub use stats::{CacheStats, LookupCounters};
