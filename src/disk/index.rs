//! Disk index and its journal.
//!
//! The index maps cache file names to the metadata pruning needs (size,
//! creation and last-access time) so age and size queries never open payload
//! files. It is persisted as an append-only JSON-lines journal that is
//! replayed at open and compacted when it grows well past the live entry
//! count. The directory itself remains the truth: `reconcile` realigns the
//! index with a scan.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::disk::scan::ScannedFile;
use crate::error::{CacheError, Result};

/// Journals shorter than this are never compacted.
const COMPACTION_FLOOR: usize = 1024;

// == Index Entry ==
/// Metadata for one record on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Byte length of the original key; 0 when recovered from a scan
    pub key_len: usize,
    /// Payload size in bytes
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

// == Journal Record ==
/// One line of the index journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    Put { name: String, entry: IndexEntry },
    Touch { name: String, at: DateTime<Utc> },
    Remove { name: String },
    Clear,
}

/// Differences fixed by reconciling the index against a directory scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Files on disk the index did not know about
    pub added: usize,
    /// Index entries whose file no longer exists
    pub dropped: usize,
    /// Entries whose recorded size disagreed with the file
    pub resized: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.added == 0 && self.dropped == 0 && self.resized == 0
    }
}

// == Disk Index ==
/// In-memory view of the records on disk.
#[derive(Debug, Default, Clone)]
pub struct DiskIndex {
    entries: HashMap<String, IndexEntry>,
    total_size: u64,
}

impl DiskIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a journal record.
    pub fn apply(&mut self, record: &JournalRecord) {
        match record {
            JournalRecord::Put { name, entry } => {
                if let Some(old) = self.entries.insert(name.clone(), entry.clone()) {
                    self.total_size -= old.size;
                }
                self.total_size += entry.size;
            }
            JournalRecord::Touch { name, at } => {
                if let Some(entry) = self.entries.get_mut(name) {
                    entry.last_access = entry.last_access.max(*at);
                }
            }
            JournalRecord::Remove { name } => {
                if let Some(old) = self.entries.remove(name) {
                    self.total_size -= old.size;
                }
            }
            JournalRecord::Clear => {
                self.entries.clear();
                self.total_size = 0;
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&IndexEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of recorded payload sizes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Names whose last access is older than `max_age` at `now`.
    pub fn expired(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<String> {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Vec::new();
        };
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.signed_duration_since(entry.last_access) > max_age)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// `(name, size)` pairs from least to most recently accessed.
    pub fn by_last_access(&self) -> Vec<(String, u64)> {
        let mut order: Vec<(&String, &IndexEntry)> = self.entries.iter().collect();
        order.sort_by(|(an, a), (bn, b)| {
            a.last_access
                .cmp(&b.last_access)
                .then(a.created_at.cmp(&b.created_at))
                .then(an.cmp(bn))
        });
        order
            .into_iter()
            .map(|(name, entry)| (name.clone(), entry.size))
            .collect()
    }

    /// Records equivalent to the current state, for journal compaction.
    pub fn snapshot(&self) -> Vec<JournalRecord> {
        self.entries
            .iter()
            .map(|(name, entry)| JournalRecord::Put {
                name: name.clone(),
                entry: entry.clone(),
            })
            .collect()
    }

    /// Realigns the index with `files`, the result of a directory scan.
    pub fn reconcile(&mut self, files: &[ScannedFile]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let on_disk: HashMap<&str, &ScannedFile> =
            files.iter().map(|f| (f.name.as_str(), f)).collect();

        let missing: Vec<String> = self
            .entries
            .keys()
            .filter(|name| !on_disk.contains_key(name.as_str()))
            .cloned()
            .collect();
        for name in missing {
            self.apply(&JournalRecord::Remove { name });
            report.dropped += 1;
        }

        for file in files {
            match self.entries.get(&file.name) {
                Some(entry) if entry.size == file.size => {}
                Some(entry) => {
                    let entry = IndexEntry {
                        size: file.size,
                        ..entry.clone()
                    };
                    self.apply(&JournalRecord::Put {
                        name: file.name.clone(),
                        entry,
                    });
                    report.resized += 1;
                }
                None => {
                    self.apply(&JournalRecord::Put {
                        name: file.name.clone(),
                        entry: IndexEntry {
                            key_len: 0,
                            size: file.size,
                            created_at: file.modified,
                            last_access: file.modified,
                        },
                    });
                    report.added += 1;
                }
            }
        }
        report
    }
}

// == Journal ==
/// Append-only persistence for the index.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
    lines: usize,
}

impl Journal {
    /// Replays the journal at `path` into an index.
    ///
    /// A missing journal yields an empty index; an unreadable line yields
    /// `IndexCorruption` so the caller can rebuild from a scan.
    pub fn replay(path: &Path) -> Result<(DiskIndex, usize)> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((DiskIndex::new(), 0)),
            Err(e) => return Err(CacheError::io(path, e)),
        };

        let mut index = DiskIndex::new();
        let mut lines = 0;
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| CacheError::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: JournalRecord = serde_json::from_str(&line).map_err(|e| {
                CacheError::IndexCorruption(format!(
                    "{} line {}: {}",
                    path.display(),
                    number + 1,
                    e
                ))
            })?;
            index.apply(&record);
            lines += 1;
        }
        Ok((index, lines))
    }

    /// Rewrites the journal at `path` to hold exactly `index`, then opens it
    /// for appending.
    pub fn create(path: &Path, index: &DiskIndex) -> Result<Self> {
        let staging = path.with_extension("compacting");
        let mut lines = 0;
        {
            let mut file = File::create(&staging).map_err(|e| CacheError::io(&staging, e))?;
            for record in index.snapshot() {
                write_record(&mut file, &record).map_err(|e| CacheError::io(&staging, e))?;
                lines += 1;
            }
            file.sync_all().map_err(|e| CacheError::io(&staging, e))?;
        }
        fs::rename(&staging, path).map_err(|e| CacheError::io(path, e))?;

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| CacheError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            lines,
        })
    }

    /// Appends one record and flushes it to the OS.
    pub fn append(&mut self, record: &JournalRecord) -> Result<()> {
        write_record(&mut self.file, record)
            .and_then(|_| self.file.flush())
            .map_err(|e| CacheError::io(&self.path, e))?;
        self.lines += 1;
        Ok(())
    }

    /// Compacts when dead lines dominate.
    pub fn compact_if_needed(&mut self, index: &DiskIndex) -> Result<bool> {
        if self.lines <= COMPACTION_FLOOR.max(index.len() * 2) {
            return Ok(false);
        }
        *self = Self::create(&self.path, index)?;
        Ok(true)
    }

    /// Rewrites the journal unconditionally.
    pub fn compact(&mut self, index: &DiskIndex) -> Result<()> {
        *self = Self::create(&self.path, index)?;
        Ok(())
    }

    pub fn lines(&self) -> usize {
        self.lines
    }
}

fn write_record(file: &mut File, record: &JournalRecord) -> io::Result<()> {
    let mut line = serde_json::to_vec(record).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    line.push(b'\n');
    file.write_all(&line)
}
