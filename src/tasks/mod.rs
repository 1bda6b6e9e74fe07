//! Background Tasks Module
//!
//! Periodic maintenance that runs alongside the cache.
//!
//! # Tasks
//! - Memory trim: applies the memory age, cost and count limits
//! - Disk prune: removes expired records, then trims to the size limit

mod maintenance;

pub use maintenance::{
    spawn_disk_prune_task, spawn_maintenance_tasks, spawn_memory_trim_task, MaintenanceTasks,
};
