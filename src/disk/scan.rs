//! Directory scanning.
//!
//! A scan of the payload directory is the ground truth the index is
//! reconciled against, and the basis of the asynchronous size calculation.

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{CacheError, Result};

/// One payload file found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFile {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Result of a full rescan: `(file_count, total_size)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub file_count: usize,
    pub total_size: u64,
}

impl DiskUsage {
    pub fn from_files(files: &[ScannedFile]) -> Self {
        Self {
            file_count: files.len(),
            total_size: files.iter().map(|f| f.size).sum(),
        }
    }
}

/// Lists regular files directly under `dir`. A missing directory is empty.
pub fn scan_directory(dir: &Path) -> Result<Vec<ScannedFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CacheError::io(dir, e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CacheError::io(dir, e))?;
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            // Removed between listing and stat
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(CacheError::io(entry.path(), e)),
        };
        if !metadata.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        files.push(ScannedFile {
            name,
            size: metadata.len(),
            modified,
        });
    }
    Ok(files)
}
