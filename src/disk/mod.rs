//! Disk Tier
//!
//! Durable key to bytes storage: one payload file per key, a journaled
//! metadata index for age and size queries, and a single worker thread that
//! serializes every mutation.

mod index;
mod naming;
mod pending;
mod scan;
mod store;

// Re-export public types
pub use index::{DiskIndex, IndexEntry, JournalRecord, ReconcileReport};
pub use naming::cache_file_name;
pub use pending::Pending;
pub use scan::{scan_directory, DiskUsage, ScannedFile};
pub use store::{
    DiskLayout, DiskOptions, DiskPayload, DiskStore, DiskWriter, ExtendedData, PayloadSource,
    PruneReport,
};
