//! Disk Store Module
//!
//! Durable key to bytes table. Every mutation runs on one dedicated worker
//! thread in FIFO order. Reads go straight to the file system unless a
//! mutation of the same record is still queued, in which case they run on the
//! worker behind it. Payloads are staged and renamed into place, and a reader
//! sees a payload and its sidecar from the same write.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc as sync_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::CacheConfig;
use crate::disk::index::{DiskIndex, IndexEntry, Journal, JournalRecord, ReconcileReport};
use crate::disk::naming::cache_file_name;
use crate::disk::pending::Pending;
use crate::disk::scan::{scan_directory, DiskUsage};
use crate::error::{CacheError, Result};

// == Record Types ==
/// Auxiliary data stored beside a payload when it cannot be derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtendedData {
    /// Display scale of the decoded image
    pub scale: f32,
}

/// Where a payload was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    /// The writable store
    Primary,
    /// The read-only overlay at this position in the configured list
    ReadOnly(usize),
}

/// Bytes read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskPayload {
    pub bytes: Vec<u8>,
    pub extended: Option<ExtendedData>,
    pub source: PayloadSource,
}

/// Outcome of a prune pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Records removed for exceeding the age limit
    pub expired: usize,
    /// Records removed to get under the size or count limit
    pub trimmed: usize,
    pub freed_bytes: u64,
}

// == Options ==
/// Disk policy, extracted from the cache config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiskOptions {
    pub max_age: Option<Duration>,
    pub max_size: Option<u64>,
    pub max_count: Option<usize>,
    pub min_retained_fraction: f64,
    pub read_only_paths: Vec<PathBuf>,
}

impl DiskOptions {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            max_age: config.max_disk_age,
            max_size: config.max_disk_size,
            max_count: config.max_disk_count,
            min_retained_fraction: config.min_retained_fraction,
            read_only_paths: config.read_only_paths.clone(),
        }
    }

    fn over_limits(&self, size: u64, count: usize) -> bool {
        self.max_size.is_some_and(|max| size > max)
            || self.max_count.is_some_and(|max| count > max)
    }
}

// == Layout ==
/// Paths inside a namespace root.
#[derive(Debug, Clone)]
pub struct DiskLayout {
    root: PathBuf,
    data: PathBuf,
    extended: PathBuf,
    staging: PathBuf,
    journal: PathBuf,
}

impl DiskLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data: root.join("data"),
            extended: root.join("extended"),
            staging: root.join("tmp"),
            journal: root.join("index.journal"),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_path(&self, name: &str) -> PathBuf {
        self.data.join(name)
    }

    pub fn extended_path(&self, name: &str) -> PathBuf {
        self.extended.join(name)
    }

    fn create(&self) -> Result<()> {
        for dir in [&self.data, &self.extended, &self.staging] {
            fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;
        }
        Ok(())
    }
}

/// What a queued mutation may change.
#[derive(Debug, Clone)]
enum Scope {
    Name(String),
    All,
}

/// Mutations sent to the worker that have not finished yet.
#[derive(Debug, Default)]
struct QueuedMutations {
    names: HashMap<String, usize>,
    clears: usize,
}

/// A primary record as read from disk.
struct StoredRecord {
    bytes: Vec<u8>,
    extended: Option<ExtendedData>,
}

struct Shared {
    layout: DiskLayout,
    options: DiskOptions,
    index: RwLock<DiskIndex>,
    /// Written while a payload or sidecar changes, read while both are read
    files: RwLock<()>,
    queued: Mutex<QueuedMutations>,
}

impl Shared {
    fn index(&self) -> RwLockReadGuard<'_, DiskIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn index_mut(&self) -> RwLockWriteGuard<'_, DiskIndex> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn files_read(&self) -> RwLockReadGuard<'_, ()> {
        self.files.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn files_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.files.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn queued(&self) -> MutexGuard<'_, QueuedMutations> {
        self.queued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark(&self, scope: &Scope) {
        let mut queued = self.queued();
        match scope {
            Scope::Name(name) => *queued.names.entry(name.clone()).or_insert(0) += 1,
            Scope::All => queued.clears += 1,
        }
    }

    fn unmark(&self, scope: &Scope) {
        let mut queued = self.queued();
        match scope {
            Scope::Name(name) => {
                if let Some(count) = queued.names.get_mut(name) {
                    *count -= 1;
                    if *count == 0 {
                        queued.names.remove(name);
                    }
                }
            }
            Scope::All => queued.clears = queued.clears.saturating_sub(1),
        }
    }

    /// True while a queued mutation may still change the record `name`.
    fn has_queued(&self, name: &str) -> bool {
        let queued = self.queued();
        queued.clears > 0 || queued.names.contains_key(name)
    }

    fn read_record(&self, name: &str) -> Result<Option<StoredRecord>> {
        let _files = self.files_read();
        let Some(bytes) = read_optional(&self.layout.data_path(name))? else {
            return Ok(None);
        };
        let extended = read_extended(&self.layout.extended_path(name));
        Ok(Some(StoredRecord { bytes, extended }))
    }
}

type Job = Box<dyn FnOnce(&mut DiskWriter) + Send + 'static>;

// == Disk Store ==
/// Handle to a disk tier rooted at one namespace directory.
///
/// Only one store may own a directory at a time.
pub struct DiskStore {
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl DiskStore {
    /// Opens the disk tier described by `config`.
    pub fn open(config: &CacheConfig) -> Result<Self> {
        Self::open_with(config.disk_root(), DiskOptions::from_config(config))
    }

    /// Opens (creating if needed) the store rooted at `root`.
    ///
    /// The journal is replayed and reconciled against a directory scan; a
    /// corrupt journal is discarded and the index rebuilt from the scan.
    pub fn open_with(root: impl Into<PathBuf>, options: DiskOptions) -> Result<Self> {
        let layout = DiskLayout::new(root);
        layout.create()?;
        reset_dir(&layout.staging)?;

        let index = load_index(&layout)?;
        let journal = Journal::create(&layout.journal, &index)?;
        info!(
            "Disk cache opened at {}: {} records, {} bytes",
            layout.root.display(),
            index.len(),
            index.total_size()
        );

        let shared = Arc::new(Shared {
            layout,
            options,
            index: RwLock::new(index),
            files: RwLock::new(()),
            queued: Mutex::new(QueuedMutations::default()),
        });
        let writer = DiskWriter {
            shared: Arc::clone(&shared),
            journal,
            staging_seq: 0,
        };

        let (jobs, rx) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name("image-cache-io".to_string())
            .spawn(move || run_worker(writer, rx))
            .map_err(|e| CacheError::io(shared.layout.root(), e))?;

        Ok(Self { shared, jobs })
    }

    pub fn layout(&self) -> &DiskLayout {
        &self.shared.layout
    }

    pub fn options(&self) -> &DiskOptions {
        &self.shared.options
    }

    // == Serialized Execution ==
    /// Runs `op` on the worker, after every previously queued operation.
    ///
    /// This is the only way to reach the synchronous [`DiskWriter`] API.
    pub fn execute<R, F>(&self, op: F) -> Pending<R>
    where
        F: FnOnce(&mut DiskWriter) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.submit(None, op)
    }

    /// Like [`execute`](Self::execute), for an operation that changes `key`.
    ///
    /// Reads of `key` issued while `op` is queued wait until it has run.
    pub fn execute_for<R, F>(&self, key: &str, op: F) -> Pending<R>
    where
        F: FnOnce(&mut DiskWriter) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.submit(Some(Scope::Name(cache_file_name(key))), op)
    }

    fn submit<R, F>(&self, scope: Option<Scope>, op: F) -> Pending<R>
    where
        F: FnOnce(&mut DiskWriter) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, pending) = Pending::channel();
        if let Some(scope) = &scope {
            self.shared.mark(scope);
        }

        let job_scope = scope.clone();
        let job: Job = Box::new(move |writer| {
            let result = op(writer);
            if let Some(scope) = &job_scope {
                writer.shared.unmark(scope);
            }
            if let Err(Err(e)) = tx.send(result) {
                warn!("Disk operation failed with nobody waiting: {}", e);
            }
        });
        if self.jobs.send(job).is_err() {
            error!("Disk worker has stopped, operation dropped");
            if let Some(scope) = &scope {
                self.shared.unmark(scope);
            }
        }
        pending
    }

    /// Runs `op` on the worker and blocks the calling thread for its result.
    ///
    /// Uses a std channel so it is safe to call from inside a runtime.
    fn run_behind_queue<R, F>(&self, op: F) -> Result<R>
    where
        F: FnOnce(&mut DiskWriter) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = sync_mpsc::sync_channel(1);
        let job: Job = Box::new(move |writer| {
            let _ = tx.send(op(writer));
        });
        self.jobs.send(job).map_err(|_| CacheError::WorkerClosed)?;
        rx.recv().map_err(|_| CacheError::WorkerClosed)
    }

    /// Queues a durable write of `payload` under `key`.
    pub fn put_async(
        &self,
        key: &str,
        payload: Vec<u8>,
        extended: Option<ExtendedData>,
    ) -> Pending<()> {
        let owned = key.to_string();
        self.execute_for(key, move |writer| writer.put(&owned, &payload, extended))
    }

    /// Queues removal of `key`; resolves to whether a payload existed.
    pub fn remove_async(&self, key: &str) -> Pending<bool> {
        let owned = key.to_string();
        self.execute_for(key, move |writer| writer.remove(&owned))
    }

    /// Queues removal of every record.
    pub fn clear_async(&self) -> Pending<()> {
        self.submit(Some(Scope::All), |writer| writer.clear())
    }

    /// Queues an age then size prune.
    pub fn prune_async(&self) -> Pending<PruneReport> {
        self.execute(|writer| writer.prune())
    }

    /// Queues a rescan that realigns the index with the directory.
    pub fn rebuild_index_async(&self) -> Pending<ReconcileReport> {
        self.execute(|writer| writer.rebuild_index())
    }

    /// Resolves once every operation queued before it has finished.
    pub fn flush(&self) -> Pending<()> {
        self.execute(|_| Ok(()))
    }

    // == Reads ==
    /// Reads the payload for `key`.
    ///
    /// The writable store is checked first, then each read-only overlay in
    /// order. Overlay hits are returned as-is and never copied.
    ///
    /// While a mutation of `key` is queued the writable store is read on the
    /// worker after it, so the result reflects every change issued earlier.
    pub fn get(&self, key: &str) -> Result<Option<DiskPayload>> {
        let name = cache_file_name(key);

        let primary = if self.shared.has_queued(&name) {
            let queued_name = name.clone();
            self.run_behind_queue(move |writer| -> Result<Option<StoredRecord>> {
                let record = writer.shared.read_record(&queued_name)?;
                if record.is_some() {
                    if let Err(e) = writer.touch(&queued_name, Utc::now()) {
                        debug!("Failed to record access for {}: {}", queued_name, e);
                    }
                }
                Ok(record)
            })??
        } else {
            let record = self.shared.read_record(&name)?;
            if record.is_some() {
                self.touch(name.clone());
            }
            record
        };

        if let Some(StoredRecord { bytes, extended }) = primary {
            return Ok(Some(DiskPayload {
                bytes,
                extended,
                source: PayloadSource::Primary,
            }));
        }

        for (position, dir) in self.shared.options.read_only_paths.iter().enumerate() {
            if let Some(bytes) = read_optional(&dir.join(&name))? {
                return Ok(Some(DiskPayload {
                    bytes,
                    extended: None,
                    source: PayloadSource::ReadOnly(position),
                }));
            }
        }
        Ok(None)
    }

    /// Presence check that never reads a payload.
    pub fn exists(&self, key: &str) -> bool {
        let name = cache_file_name(key);
        let in_primary = if self.shared.has_queued(&name) {
            let queued_name = name.clone();
            let queued = self.run_behind_queue(move |writer| {
                let index = writer.index();
                index.contains(&queued_name)
            });
            match queued {
                Ok(contains) => contains,
                Err(e) => {
                    debug!("Falling back to current index for {}: {}", name, e);
                    self.shared.index().contains(&name)
                }
            }
        } else {
            self.shared.index().contains(&name)
        };

        in_primary
            || self
                .shared
                .options
                .read_only_paths
                .iter()
                .any(|dir| dir.join(&name).is_file())
    }

    // == Accounting ==
    /// Total payload bytes according to the index.
    pub fn total_size(&self) -> u64 {
        self.shared.index().total_size()
    }

    /// Record count according to the index.
    pub fn total_count(&self) -> usize {
        self.shared.index().len()
    }

    /// Counts files and bytes with a full directory scan on its own thread.
    pub fn calculate_size_async(&self) -> Pending<DiskUsage> {
        let data = self.shared.layout.data.clone();
        let (tx, pending) = Pending::channel();
        let spawned = thread::Builder::new()
            .name("image-cache-scan".to_string())
            .spawn(move || {
                let _ = tx.send(scan_directory(&data).map(|files| DiskUsage::from_files(&files)));
            });
        if let Err(e) = spawned {
            error!("Failed to start disk size scan: {}", e);
        }
        pending
    }

    fn touch(&self, name: String) {
        let at = Utc::now();
        let job: Job = Box::new(move |writer| {
            if let Err(e) = writer.touch(&name, at) {
                debug!("Failed to record access for {}: {}", name, e);
            }
        });
        if self.jobs.send(job).is_err() {
            debug!("Disk worker has stopped, access not recorded");
        }
    }
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore")
            .field("root", &self.shared.layout.root)
            .field("options", &self.shared.options)
            .finish()
    }
}

// == Disk Writer ==
/// Synchronous disk API, owned by the worker thread.
///
/// Reachable only through [`DiskStore::execute`], so every call is
/// serialized with all other mutations of the same store. Each mutation
/// finishes its file system work before the index is updated.
pub struct DiskWriter {
    shared: Arc<Shared>,
    journal: Journal,
    staging_seq: u64,
}

impl DiskWriter {
    /// Writes `payload` under `key`, stamped with the current time.
    pub fn put(&mut self, key: &str, payload: &[u8], extended: Option<ExtendedData>) -> Result<()> {
        self.put_at(key, payload, extended, Utc::now())
    }

    /// Writes `payload` under `key` with an explicit creation time.
    pub fn put_at(
        &mut self,
        key: &str,
        payload: &[u8],
        extended: Option<ExtendedData>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let name = cache_file_name(key);
        let shared = Arc::clone(&self.shared);
        let extended_path = shared.layout.extended_path(&name);

        let staged_extended = match extended {
            Some(extended) => {
                let json = serde_json::to_vec(&extended).map_err(|e| {
                    CacheError::io(&extended_path, io::Error::new(io::ErrorKind::InvalidData, e))
                })?;
                Some(self.stage(&json)?)
            }
            None => None,
        };
        let staged_data = match self.stage(payload) {
            Ok(staged) => staged,
            Err(e) => {
                discard(staged_extended.as_deref());
                return Err(e);
            }
        };

        // Both renames happen under one lock so readers never mix two writes
        let installed = {
            let _files = shared.files_write();
            let sidecar = match &staged_extended {
                Some(staged) => install(staged, &extended_path),
                None => remove_optional(&extended_path).map(|_| ()),
            };
            sidecar.and_then(|()| install(&staged_data, &shared.layout.data_path(&name)))
        };
        if let Err(e) = installed {
            discard(staged_extended.as_deref());
            discard(Some(staged_data.as_path()));
            return Err(e);
        }

        self.commit(JournalRecord::Put {
            name,
            entry: IndexEntry {
                key_len: key.len(),
                size: payload.len() as u64,
                created_at: at,
                last_access: at,
            },
        })
    }

    /// Deletes the record for `key`; returns whether a payload existed.
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        self.remove_name(&cache_file_name(key))
    }

    /// Deletes every record.
    pub fn clear(&mut self) -> Result<()> {
        {
            let _files = self.shared.files_write();
            reset_dir(&self.shared.layout.data)?;
            reset_dir(&self.shared.layout.extended)?;
        }
        self.shared.index_mut().apply(&JournalRecord::Clear);

        let index = self.shared.index();
        self.journal.compact(&index)
    }

    /// Records an access to the file `name` at `at`.
    pub fn touch(&mut self, name: &str, at: DateTime<Utc>) -> Result<()> {
        if !self.shared.index().contains(name) {
            return Ok(());
        }
        self.commit(JournalRecord::Touch {
            name: name.to_string(),
            at,
        })
    }

    /// Prunes against the current time.
    pub fn prune(&mut self) -> Result<PruneReport> {
        self.prune_at(Utc::now())
    }

    /// Removes records idle longer than the age limit, then, while the size
    /// or count limit is exceeded, removes the least recently accessed ones.
    ///
    /// The second phase stops early rather than leave less than
    /// `min_retained_fraction` of the bytes it started with.
    pub fn prune_at(&mut self, now: DateTime<Utc>) -> Result<PruneReport> {
        let shared = Arc::clone(&self.shared);
        let options = &shared.options;
        let mut report = PruneReport::default();

        if let Some(max_age) = options.max_age {
            let expired = shared.index().expired(now, max_age);
            for name in expired {
                let size = shared.index().get(&name).map_or(0, |entry| entry.size);
                self.remove_name(&name)?;
                report.expired += 1;
                report.freed_bytes += size;
            }
        }

        let (mut size, mut count) = {
            let index = shared.index();
            (index.total_size(), index.len())
        };
        if options.over_limits(size, count) {
            let floor = (size as f64 * options.min_retained_fraction) as u64;
            let order = shared.index().by_last_access();
            for (name, entry_size) in order {
                if !options.over_limits(size, count) || size.saturating_sub(entry_size) < floor {
                    break;
                }
                self.remove_name(&name)?;
                size -= entry_size;
                count -= 1;
                report.trimmed += 1;
                report.freed_bytes += entry_size;
            }
        }

        if report.expired + report.trimmed > 0 {
            info!(
                "Disk prune: {} expired, {} trimmed, {} bytes freed",
                report.expired, report.trimmed, report.freed_bytes
            );
        } else {
            debug!("Disk prune: nothing to remove");
        }
        Ok(report)
    }

    /// Realigns the index with a fresh directory scan and rewrites the journal.
    pub fn rebuild_index(&mut self) -> Result<ReconcileReport> {
        let files = scan_directory(&self.shared.layout.data)?;
        let report = self.shared.index_mut().reconcile(&files);
        if !report.is_clean() {
            warn!(
                "Disk index rebuilt: {} added, {} dropped, {} resized",
                report.added, report.dropped, report.resized
            );
        }
        let index = self.shared.index();
        self.journal.compact(&index)?;
        Ok(report)
    }

    /// Read access to the index from inside the worker.
    pub fn index(&self) -> RwLockReadGuard<'_, DiskIndex> {
        self.shared.index()
    }

    fn remove_name(&mut self, name: &str) -> Result<bool> {
        let existed = {
            let _files = self.shared.files_write();
            let existed = remove_optional(&self.shared.layout.data_path(name))?;
            remove_optional(&self.shared.layout.extended_path(name))?;
            existed
        };

        if existed || self.shared.index().contains(name) {
            self.commit(JournalRecord::Remove {
                name: name.to_string(),
            })?;
        }
        Ok(existed)
    }

    /// Writes `bytes` to a fresh staging file and syncs it.
    fn stage(&mut self, bytes: &[u8]) -> Result<PathBuf> {
        self.staging_seq += 1;
        let staging = self.shared.layout.staging.join(self.staging_seq.to_string());

        let written = File::create(&staging).and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&staging);
            return Err(CacheError::io(&staging, e));
        }
        Ok(staging)
    }

    fn commit(&mut self, record: JournalRecord) -> Result<()> {
        self.shared.index_mut().apply(&record);
        self.journal.append(&record)?;

        let index = self.shared.index();
        if self.journal.compact_if_needed(&index)? {
            debug!("Disk journal compacted to {} records", index.len());
        }
        Ok(())
    }
}

// == Worker ==
fn run_worker(mut writer: DiskWriter, mut jobs: mpsc::UnboundedReceiver<Job>) {
    debug!(
        "Disk worker started for {}",
        writer.shared.layout.root.display()
    );
    while let Some(job) = jobs.blocking_recv() {
        job(&mut writer);
    }
    debug!("Disk worker stopped");
}

fn load_index(layout: &DiskLayout) -> Result<DiskIndex> {
    let mut index = match Journal::replay(&layout.journal) {
        Ok((index, _)) => index,
        Err(CacheError::IndexCorruption(reason)) => {
            warn!("Disk index corrupt ({}), rebuilding from directory scan", reason);
            DiskIndex::new()
        }
        Err(e) => return Err(e),
    };

    let report = index.reconcile(&scan_directory(&layout.data)?);
    if !report.is_clean() {
        info!(
            "Disk index reconciled: {} added, {} dropped, {} resized",
            report.added, report.dropped, report.resized
        );
    }
    Ok(index)
}

// == File Helpers ==
fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

fn read_extended(path: &Path) -> Option<ExtendedData> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Unreadable extended data {}: {}", path.display(), e);
            return None;
        }
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| warn!("Malformed extended data {}: {}", path.display(), e))
        .ok()
}

fn install(staged: &Path, dest: &Path) -> Result<()> {
    fs::rename(staged, dest).map_err(|e| CacheError::io(dest, e))
}

fn discard(staged: Option<&Path>) {
    if let Some(staged) = staged {
        let _ = fs::remove_file(staged);
    }
}

fn remove_optional(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

fn reset_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(CacheError::io(dir, e)),
    }
    fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    const DAY: u64 = 86_400;

    fn open(dir: &TempDir, options: DiskOptions) -> DiskStore {
        DiskStore::open_with(dir.path().join("ns"), options).unwrap()
    }

    #[test]
    fn test_put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, DiskOptions::default());

        store.put_async("a.png", b"payload".to_vec(), None).wait_blocking().unwrap();

        let payload = store.get("a.png").unwrap().unwrap();
        assert_eq!(payload.bytes, b"payload");
        assert_eq!(payload.extended, None);
        assert_eq!(payload.source, PayloadSource::Primary);
        assert!(store.exists("a.png"));
        assert_eq!(store.total_count(), 1);
        assert_eq!(store.total_size(), 7);
    }

    #[test]
    fn test_get_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, DiskOptions::default());

        assert_eq!(store.get("missing").unwrap(), None);
        assert!(!store.exists("missing"));
    }

    #[test]
    fn test_extended_data_roundtrip_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, DiskOptions::default());

        store
            .put_async("k", b"2x".to_vec(), Some(ExtendedData { scale: 2.0 }))
            .wait_blocking()
            .unwrap();
        let payload = store.get("k").unwrap().unwrap();
        assert_eq!(payload.extended, Some(ExtendedData { scale: 2.0 }));

        // Rewriting at unit scale drops the stale sidecar
        store.put_async("k", b"1x".to_vec(), None).wait_blocking().unwrap();
        assert_eq!(store.get("k").unwrap().unwrap().extended, None);
    }

    #[test]
    fn test_remove_after_put_is_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, DiskOptions::default());

        // Neither call is awaited before the next is queued
        let put = store.put_async("k", vec![1, 2, 3], None);
        let removed = store.remove_async("k");

        put.wait_blocking().unwrap();
        assert!(removed.wait_blocking().unwrap());
        assert_eq!(store.get("k").unwrap(), None);
        assert_eq!(store.total_size(), 0);
    }

    /// Occupies the worker so later jobs stay queued for a while.
    fn stall_worker(store: &DiskStore, millis: u64) {
        store.execute(move |_| {
            thread::sleep(Duration::from_millis(millis));
            Ok(())
        });
    }

    #[test]
    fn test_get_waits_for_queued_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, DiskOptions::default());
        store.put_async("k", vec![1, 2, 3], None).wait_blocking().unwrap();

        stall_worker(&store, 300);
        let removed = store.remove_async("k");

        assert_eq!(store.get("k").unwrap(), None);
        assert!(!store.exists("k"));
        assert!(removed.wait_blocking().unwrap());
    }

    #[test]
    fn test_get_waits_for_queued_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, DiskOptions::default());
        store.put_async("a", vec![1], None).wait_blocking().unwrap();

        stall_worker(&store, 300);
        store.clear_async();

        assert_eq!(store.get("a").unwrap(), None);
        assert!(!store.exists("a"));
    }

    #[test]
    fn test_get_sees_queued_put() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, DiskOptions::default());

        stall_worker(&store, 200);
        store.put_async("k", b"fresh".to_vec(), Some(ExtendedData { scale: 3.0 }));

        let payload = store.get("k").unwrap().unwrap();
        assert_eq!(payload.bytes, b"fresh");
        assert_eq!(payload.extended, Some(ExtendedData { scale: 3.0 }));
        assert!(store.exists("k"));
    }

    #[test]
    fn test_reads_never_mix_payload_and_scale() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open(&dir, DiskOptions::default()));
        store.put_async("k", b"1x".to_vec(), None).wait_blocking().unwrap();

        let writer_store = Arc::clone(&store);
        let writes = thread::spawn(move || {
            for round in 0..200 {
                // Unkeyed so readers keep going straight to the files
                let (bytes, extended) = if round % 2 == 0 {
                    (b"2x".to_vec(), Some(ExtendedData { scale: 2.0 }))
                } else {
                    (b"1x".to_vec(), None)
                };
                writer_store
                    .execute(move |writer| writer.put("k", &bytes, extended))
                    .wait_blocking()
                    .unwrap();
            }
        });

        while !writes.is_finished() {
            let payload = store.get("k").unwrap().unwrap();
            match payload.bytes.as_slice() {
                b"2x" => assert_eq!(payload.extended, Some(ExtendedData { scale: 2.0 })),
                b"1x" => assert_eq!(payload.extended, None),
                other => panic!("unexpected payload {:?}", other),
            }
        }
        writes.join().unwrap();
    }

    #[test]
    fn test_reads_survive_stopped_worker() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, DiskOptions::default());
        store.put_async("k", vec![7], None).wait_blocking().unwrap();

        store.execute::<(), _>(|_| panic!("worker failure"));
        assert!(matches!(
            store.flush().wait_blocking(),
            Err(CacheError::WorkerClosed)
        ));

        // The access can no longer be recorded; the read still succeeds
        assert_eq!(store.get("k").unwrap().unwrap().bytes, vec![7]);
        assert!(store.exists("k"));
        assert!(matches!(
            store.remove_async("k").wait_blocking(),
            Err(CacheError::WorkerClosed)
        ));
        assert_eq!(store.get("k").unwrap().unwrap().bytes, vec![7]);
    }

    #[test]
    fn test_clear_twice() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, DiskOptions::default());
        store.put_async("a", vec![0; 10], None);
        store.put_async("b", vec![0; 10], None);

        store.clear_async().wait_blocking().unwrap();
        assert_eq!(store.total_size(), 0);

        store.clear_async().wait_blocking().unwrap();
        assert_eq!(store.total_size(), 0);
        assert_eq!(store.total_count(), 0);
    }

    #[test]
    fn test_prune_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(
            &dir,
            DiskOptions {
                max_age: Some(Duration::from_secs(7 * DAY)),
                ..DiskOptions::default()
            },
        );
        let now = Utc::now();

        let report = store
            .execute(move |writer| {
                for days in [1, 5, 10, 20] {
                    let at = now - ChronoDuration::days(days);
                    writer.put_at(&format!("day-{}", days), &[0; 4], None, at)?;
                }
                writer.prune_at(now)
            })
            .wait_blocking()
            .unwrap();

        assert_eq!(report.expired, 2);
        assert_eq!(report.trimmed, 0);
        assert!(store.exists("day-1"));
        assert!(store.exists("day-5"));
        assert!(!store.exists("day-10"));
        assert!(!store.exists("day-20"));
    }

    #[test]
    fn test_prune_by_size_removes_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(
            &dir,
            DiskOptions {
                max_size: Some(25),
                ..DiskOptions::default()
            },
        );
        let now = Utc::now();

        let report = store
            .execute(move |writer| {
                for (key, age) in [("old", 30), ("older", 40), ("new", 1), ("mid", 10)] {
                    writer.put_at(key, &[0; 10], None, now - ChronoDuration::minutes(age))?;
                }
                writer.prune_at(now)
            })
            .wait_blocking()
            .unwrap();

        assert_eq!(report.trimmed, 2);
        assert_eq!(report.freed_bytes, 20);
        assert!(!store.exists("older"));
        assert!(!store.exists("old"));
        assert!(store.exists("mid"));
        assert!(store.exists("new"));
    }

    #[test]
    fn test_prune_respects_retained_fraction() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(
            &dir,
            DiskOptions {
                max_size: Some(10),
                min_retained_fraction: 0.5,
                ..DiskOptions::default()
            },
        );
        let now = Utc::now();

        let report = store
            .execute(move |writer| {
                for age in 1..=4 {
                    let key = format!("k{}", age);
                    writer.put_at(&key, &[0; 10], None, now - ChronoDuration::minutes(age))?;
                }
                writer.prune_at(now)
            })
            .wait_blocking()
            .unwrap();

        // 40 bytes, floor 20: stops after two removals although still over 10
        assert_eq!(report.trimmed, 2);
        assert_eq!(store.total_size(), 20);
    }

    #[test]
    fn test_prune_by_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(
            &dir,
            DiskOptions {
                max_count: Some(1),
                ..DiskOptions::default()
            },
        );
        for key in ["a", "b", "c"] {
            store.put_async(key, vec![1], None);
        }

        let report = store.prune_async().wait_blocking().unwrap();
        assert_eq!(report.trimmed, 2);
        assert_eq!(store.total_count(), 1);
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir, DiskOptions::default());
            store.put_async("a", vec![0; 3], None);
            store.put_async("b", vec![0; 5], None);
            store.remove_async("a");
            store.flush().wait_blocking().unwrap();
        }

        let store = open(&dir, DiskOptions::default());
        assert_eq!(store.total_count(), 1);
        assert_eq!(store.total_size(), 5);
        assert_eq!(store.get("b").unwrap().unwrap().bytes, vec![0; 5]);
    }

    #[test]
    fn test_corrupt_journal_is_rebuilt_from_scan() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir, DiskOptions::default());
            store.put_async("a", vec![0; 3], None);
            store.put_async("b", vec![0; 4], None);
            store.flush().wait_blocking().unwrap();
        }
        fs::write(dir.path().join("ns").join("index.journal"), "{broken").unwrap();

        let store = open(&dir, DiskOptions::default());
        assert_eq!(store.total_count(), 2);
        assert_eq!(store.total_size(), 7);
    }

    #[test]
    fn test_rebuild_index_picks_up_external_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, DiskOptions::default());
        store.put_async("a", vec![0; 3], None).wait_blocking().unwrap();

        fs::remove_file(store.layout().data_path(&cache_file_name("a"))).unwrap();
        fs::write(store.layout().data_path("stray"), [0; 6]).unwrap();

        let report = store.rebuild_index_async().wait_blocking().unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(store.total_size(), 6);
    }

    #[test]
    fn test_read_only_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        fs::create_dir_all(&bundle).unwrap();
        fs::write(bundle.join(cache_file_name("shipped.png")), b"bundled").unwrap();

        let store = open(
            &dir,
            DiskOptions {
                read_only_paths: vec![dir.path().join("empty"), bundle],
                ..DiskOptions::default()
            },
        );

        let payload = store.get("shipped.png").unwrap().unwrap();
        assert_eq!(payload.bytes, b"bundled");
        assert_eq!(payload.source, PayloadSource::ReadOnly(1));
        assert!(store.exists("shipped.png"));

        // Overlay hits are never copied into the writable store
        store.flush().wait_blocking().unwrap();
        assert_eq!(store.total_count(), 0);
    }

    #[test]
    fn test_calculate_size_matches_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, DiskOptions::default());
        store.put_async("a", vec![0; 3], None);
        store.put_async("b", vec![0; 9], None);
        store.flush().wait_blocking().unwrap();

        let usage = store.calculate_size_async().wait_blocking().unwrap();
        assert_eq!(
            usage,
            DiskUsage {
                file_count: 2,
                total_size: 12
            }
        );
        assert_eq!(usage.total_size, store.total_size());
    }

    #[test]
    fn test_get_refreshes_last_access() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, DiskOptions::default());
        let past = Utc::now() - ChronoDuration::days(3);
        store
            .execute(move |writer| writer.put_at("k", &[1], None, past))
            .wait_blocking()
            .unwrap();

        store.get("k").unwrap();
        let last_access = store
            .execute(|writer| {
                let index = writer.index();
                let last_access = index.get(&cache_file_name("k")).map(|e| e.last_access);
                Ok(last_access)
            })
            .wait_blocking()
            .unwrap();
        assert!(last_access.unwrap() > past);
    }
}
