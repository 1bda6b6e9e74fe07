//! Maintenance Tasks
//!
//! Background tasks that periodically trim the memory tier and prune the
//! disk tier of an [`ImageCache`].

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{ImageCache, ImageCodec};

/// Handles of the running maintenance tasks.
#[derive(Debug)]
pub struct MaintenanceTasks {
    pub memory_trim: JoinHandle<()>,
    /// Absent when the disk tier is disabled
    pub disk_prune: Option<JoinHandle<()>>,
}

impl MaintenanceTasks {
    /// Stops every task. Used during graceful shutdown.
    pub fn abort(&self) {
        self.memory_trim.abort();
        if let Some(disk_prune) = &self.disk_prune {
            disk_prune.abort();
        }
    }
}

/// Spawns both maintenance tasks with the intervals from the cache config.
pub fn spawn_maintenance_tasks<C: ImageCodec>(cache: &ImageCache<C>) -> MaintenanceTasks {
    let config = cache.config();
    MaintenanceTasks {
        memory_trim: spawn_memory_trim_task(cache.clone(), config.memory_trim_interval),
        disk_prune: cache
            .disk()
            .is_some()
            .then(|| spawn_disk_prune_task(cache.clone(), config.disk_trim_interval)),
    }
}

/// Spawns a task that applies the memory limits every `interval`.
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
pub fn spawn_memory_trim_task<C: ImageCodec>(
    cache: ImageCache<C>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting memory trim task with interval of {:?}", interval);

        loop {
            tokio::time::sleep(interval).await;

            let evicted = cache.trim_memory();
            if evicted > 0 {
                info!("Memory trim: evicted {} entries", evicted);
            } else {
                debug!("Memory trim: nothing to evict");
            }
        }
    })
}

/// Spawns a task that prunes the disk tier every `interval`.
///
/// Each prune is queued on the disk worker like any other mutation, so it
/// never races a write.
pub fn spawn_disk_prune_task<C: ImageCodec>(
    cache: ImageCache<C>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting disk prune task with interval of {:?}", interval);

        loop {
            tokio::time::sleep(interval).await;

            if let Err(e) = cache.prune_disk_async().wait().await {
                warn!("Disk prune failed: {}", e);
            }
        }
    })
}
