//! Image Cache Module
//!
//! The public facade over the two tiers. Reads go memory, then disk, then
//! miss; writes land in memory before `store` returns and are queued for
//! disk. Disk failures never escape a lookup: they are logged and reported
//! as a miss.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cache::format::{ImageCodec, StoreRequest, StoreTargets};
use crate::cache::handle::{Delivery, QueryHandle};
use crate::cache::stats::{CacheStats, LookupCounters};
use crate::config::CacheConfig;
use crate::disk::{DiskStore, DiskUsage, Pending, PruneReport};
use crate::error::Result;
use crate::memory::{MemoryLimits, MemoryStore};

// == Lookup Result ==
/// Tier that satisfied a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheTier {
    Memory,
    Disk,
    None,
}

/// Outcome of a lookup, tagged with the tier that answered it.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<I> {
    Memory(I),
    Disk(I),
    Miss,
}

impl<I> Lookup<I> {
    pub fn tier(&self) -> CacheTier {
        match self {
            Lookup::Memory(_) => CacheTier::Memory,
            Lookup::Disk(_) => CacheTier::Disk,
            Lookup::Miss => CacheTier::None,
        }
    }

    pub fn image(&self) -> Option<&I> {
        match self {
            Lookup::Memory(image) | Lookup::Disk(image) => Some(image),
            Lookup::Miss => None,
        }
    }

    pub fn into_image(self) -> Option<I> {
        match self {
            Lookup::Memory(image) | Lookup::Disk(image) => Some(image),
            Lookup::Miss => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        !matches!(self, Lookup::Miss)
    }
}

struct Inner<C: ImageCodec> {
    config: CacheConfig,
    codec: C,
    memory: MemoryStore<C::Image>,
    disk: Option<DiskStore>,
    counters: LookupCounters,
    /// Bumped by every write or removal; a disk read only promotes its result
    /// if no write or removal happened while it was in flight.
    generation: AtomicU64,
    /// Readers: promotions. Writers: stores and removals. Makes the
    /// generation check and the memory insert one step.
    promotion_gate: RwLock<()>,
}

// == Image Cache ==
/// Two-tier image cache handle. Clones share the same stores.
///
/// Construct one per cache directory at startup and pass it to every caller.
pub struct ImageCache<C: ImageCodec> {
    inner: Arc<Inner<C>>,
}

impl<C: ImageCodec> Clone for ImageCache<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: ImageCodec> ImageCache<C> {
    // == Constructor ==
    /// Opens the cache described by `config`, decoding with `codec`.
    pub fn open(config: CacheConfig, codec: C) -> Result<Self> {
        config.validate()?;

        let disk = if config.disk_enabled {
            Some(DiskStore::open(&config)?)
        } else {
            None
        };
        let memory = MemoryStore::new(MemoryLimits::from_config(&config));
        info!(
            "Image cache ready: namespace={}, memory={}, disk={}",
            config.namespace, config.memory_enabled, config.disk_enabled
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                codec,
                memory,
                disk,
                counters: LookupCounters::new(),
                generation: AtomicU64::new(0),
                promotion_gate: RwLock::new(()),
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    pub fn memory(&self) -> &MemoryStore<C::Image> {
        &self.inner.memory
    }

    pub fn disk(&self) -> Option<&DiskStore> {
        self.inner.disk.as_ref()
    }

    // == Store ==
    /// Stores an image under `key` in the requested tiers.
    ///
    /// The memory write is visible before this returns. The disk write is
    /// queued; the returned handle resolves when it is durable. A disk
    /// failure only surfaces through the handle when memory was not written.
    pub fn store(
        &self,
        key: &str,
        request: StoreRequest<C::Image>,
        targets: StoreTargets,
    ) -> Pending<()> {
        let to_memory = targets.memory && self.inner.config.memory_enabled;
        let to_disk = targets.disk && self.inner.disk.is_some();

        let memory_image = if to_memory {
            let image = request.image.clone().or_else(|| {
                request
                    .data
                    .as_deref()
                    .and_then(|data| self.inner.codec.decode(data, request.scale))
            });
            if image.is_none() {
                warn!("Nothing decodable to keep in memory for {}", key);
            }
            image
        } else {
            None
        };
        let stored_in_memory = memory_image.is_some();

        // Queued before the generation bump, so a read that sees the new
        // generation also sees the queued write
        let pending = match self.inner.disk.as_ref().filter(|_| to_disk) {
            Some(disk) => match request.disk_payload(&self.inner.codec) {
                Some(payload) => {
                    let extended = request.extended_data();
                    let owned = key.to_string();
                    disk.execute_for(key, move |writer| {
                        match writer.put(&owned, &payload, extended) {
                            Err(e) if stored_in_memory => {
                                warn!("Disk write for {} failed, kept in memory only: {}", owned, e);
                                Ok(())
                            }
                            result => result,
                        }
                    })
                }
                None => {
                    warn!("No encodable payload for {}, skipping disk write", key);
                    Pending::ready(Ok(()))
                }
            },
            None => Pending::ready(Ok(())),
        };

        {
            let _gate = self.write_gate();
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
            if let Some(image) = memory_image {
                let cost = self.inner.codec.cost(&image);
                self.inner.memory.put(key, image, cost);
            }
        }
        pending
    }

    // == Synchronous Queries ==
    /// Looks up `key` in memory, then on disk. May block on disk I/O.
    pub fn query(&self, key: &str) -> Option<C::Image> {
        self.lookup(key).into_image()
    }

    /// Like [`query`](Self::query) but reports which tier answered.
    pub fn lookup(&self, key: &str) -> Lookup<C::Image> {
        let lookup = match self.memory_lookup(key) {
            Some(image) => Lookup::Memory(image),
            None => self.disk_lookup(key),
        };
        self.inner.counters.record(lookup.tier());
        lookup
    }

    /// Memory tier only; never touches the disk.
    pub fn query_memory(&self, key: &str) -> Option<C::Image> {
        self.memory_lookup(key)
    }

    /// Disk tier only; a hit is promoted into memory.
    pub fn query_disk(&self, key: &str) -> Option<C::Image> {
        self.disk_lookup(key).into_image()
    }

    /// Metadata-only presence check on the disk tier.
    pub fn contains_on_disk(&self, key: &str) -> bool {
        self.inner
            .disk
            .as_ref()
            .is_some_and(|disk| disk.exists(key))
    }

    // == Asynchronous Queries ==
    /// Looks up `key` off the calling thread and hands the result to `callback`.
    ///
    /// A memory hit is delivered before this returns. Otherwise the disk read
    /// runs on the Tokio blocking pool (or a fresh thread outside a runtime)
    /// and the callback fires there unless the handle was cancelled first.
    pub fn query_async<F>(&self, key: &str, callback: F) -> QueryHandle
    where
        F: FnOnce(Lookup<C::Image>) + Send + 'static,
    {
        if let Some(image) = self.memory_lookup(key) {
            self.inner.counters.record(CacheTier::Memory);
            callback(Lookup::Memory(image));
            return QueryHandle::completed();
        }

        let (delivery, handle) = Delivery::new(callback);
        let cache = self.clone();
        let key = key.to_string();
        let task = move || {
            let lookup = cache.disk_lookup(&key);
            cache.inner.counters.record(lookup.tier());
            if !delivery.deliver(lookup) {
                debug!("Query for {} cancelled before delivery", key);
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(task);
            }
            Err(_) => {
                if let Err(e) = thread::Builder::new()
                    .name("image-cache-query".to_string())
                    .spawn(task)
                {
                    error!("Failed to start query thread: {}", e);
                }
            }
        }
        handle
    }

    /// Async lookup; the disk read runs on the blocking pool.
    pub async fn fetch(&self, key: &str) -> Lookup<C::Image> {
        if let Some(image) = self.memory_lookup(key) {
            self.inner.counters.record(CacheTier::Memory);
            return Lookup::Memory(image);
        }

        let cache = self.clone();
        let owned_key = key.to_string();
        let lookup = match tokio::task::spawn_blocking(move || cache.disk_lookup(&owned_key)).await {
            Ok(lookup) => lookup,
            Err(e) => {
                error!("Disk lookup task for {} failed: {}", key, e);
                Lookup::Miss
            }
        };
        self.inner.counters.record(lookup.tier());
        lookup
    }

    // == Removal ==
    /// Removes `key` from the requested tiers.
    ///
    /// The memory removal is immediate; the handle resolves once the disk
    /// removal has run.
    pub fn remove(&self, key: &str, targets: StoreTargets) -> Pending<()> {
        // Queued first: once the generation moves, disk reads of `key` wait
        // behind the removal instead of promoting the doomed payload
        let pending = match self.inner.disk.as_ref().filter(|_| targets.disk) {
            Some(disk) => {
                let owned = key.to_string();
                disk.execute_for(key, move |writer| writer.remove(&owned).map(|_| ()))
            }
            None => Pending::ready(Ok(())),
        };

        {
            let _gate = self.write_gate();
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
            if targets.memory {
                self.inner.memory.remove(key);
            }
        }
        pending
    }

    /// Empties the memory tier.
    pub fn clear_memory(&self) {
        let _gate = self.write_gate();
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner.memory.remove_all();
    }

    /// Reacts to a memory-pressure signal from the host by emptying memory.
    pub fn handle_memory_pressure(&self) {
        let resident = self.inner.memory.len();
        self.clear_memory();
        info!("Memory pressure: dropped {} resident images", resident);
    }

    /// Applies the configured memory limits; returns the number evicted.
    pub fn trim_memory(&self) -> usize {
        self.inner.memory.trim()
    }

    /// Queues removal of every disk record. Completes even when already empty.
    pub fn clear_disk_async(&self) -> Pending<()> {
        let pending = match &self.inner.disk {
            Some(disk) => disk.clear_async(),
            None => Pending::ready(Ok(())),
        };
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        pending
    }

    /// Queues an age and size prune of the disk tier.
    pub fn prune_disk_async(&self) -> Pending<PruneReport> {
        match &self.inner.disk {
            Some(disk) => disk.prune_async(),
            None => Pending::ready(Ok(PruneReport::default())),
        }
    }

    /// Resolves once every disk operation queued so far has run.
    pub fn flush(&self) -> Pending<()> {
        match &self.inner.disk {
            Some(disk) => disk.flush(),
            None => Pending::ready(Ok(())),
        }
    }

    // == Accounting ==
    /// Payload bytes on disk, from the index.
    pub fn disk_size(&self) -> u64 {
        self.inner.disk.as_ref().map_or(0, DiskStore::total_size)
    }

    /// Records on disk, from the index.
    pub fn disk_count(&self) -> usize {
        self.inner.disk.as_ref().map_or(0, DiskStore::total_count)
    }

    /// `(file_count, total_size)` from a full directory scan.
    pub fn calculate_size_async(&self) -> Pending<DiskUsage> {
        match &self.inner.disk {
            Some(disk) => disk.calculate_size_async(),
            None => Pending::ready(Ok(DiskUsage::default())),
        }
    }

    /// Snapshot of lookup counters and tier totals.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            evictions: self.inner.memory.evictions(),
            memory_entries: self.inner.memory.len(),
            memory_cost: self.inner.memory.total_cost(),
            disk_entries: self.disk_count(),
            disk_size: self.disk_size(),
            ..CacheStats::default()
        };
        self.inner.counters.fill(&mut stats);
        stats
    }

    // == Internals ==
    fn memory_lookup(&self, key: &str) -> Option<C::Image> {
        if !self.inner.config.memory_enabled {
            return None;
        }
        self.inner.memory.get(key)
    }

    fn disk_lookup(&self, key: &str) -> Lookup<C::Image> {
        let Some(disk) = self.inner.disk.as_ref() else {
            return Lookup::Miss;
        };
        let generation = self.inner.generation.load(Ordering::Acquire);

        let payload = match disk.get(key) {
            Ok(Some(payload)) => payload,
            Ok(None) => return Lookup::Miss,
            Err(e) => {
                warn!("Disk read for {} failed, treating as miss: {}", key, e);
                return Lookup::Miss;
            }
        };

        let scale = payload.extended.map_or(1.0, |extended| extended.scale);
        let Some(image) = self.inner.codec.decode(&payload.bytes, scale) else {
            warn!("Undecodable disk payload for {}, treating as miss", key);
            return Lookup::Miss;
        };

        if self.inner.config.memory_enabled {
            self.promote(key, &image, generation);
        }
        Lookup::Disk(image)
    }

    fn promote(&self, key: &str, image: &C::Image, generation: u64) {
        let _gate = self
            .inner
            .promotion_gate
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.generation.load(Ordering::Acquire) != generation {
            debug!("Skipping promotion of {}: cache changed during read", key);
            return;
        }
        let cost = self.inner.codec.cost(image);
        self.inner.memory.put(key, image.clone(), cost);
    }

    fn write_gate(&self) -> std::sync::RwLockWriteGuard<'_, ()> {
        self.inner
            .promotion_gate
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: ImageCodec> std::fmt::Debug for ImageCache<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("namespace", &self.inner.config.namespace)
            .field("memory_entries", &self.inner.memory.len())
            .field("disk", &self.inner.disk)
            .finish()
    }
}
