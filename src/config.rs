//! Configuration Module
//!
//! Cache policy: tier switches, memory limits, disk limits, read-only overlay
//! paths and maintenance intervals. Immutable once the cache is opened.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CacheError, Result};

/// One week, the default disk age limit.
pub const DEFAULT_MAX_DISK_AGE_SECS: u64 = 60 * 60 * 24 * 7;

/// Cache configuration parameters.
///
/// Limits expressed as `Option` are unlimited when `None`. Every value can be
/// loaded from environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Root directory holding one subdirectory per namespace
    pub directory: PathBuf,
    /// Namespace subdirectory owned by this cache
    pub namespace: String,
    /// Keep decoded images in memory
    pub memory_enabled: bool,
    /// Persist payloads to disk
    pub disk_enabled: bool,
    /// Maximum total cost of resident memory entries
    pub max_memory_cost: Option<u64>,
    /// Maximum number of resident memory entries
    pub max_memory_count: Option<usize>,
    /// Memory entries idle longer than this are trimmed
    pub max_memory_age: Option<Duration>,
    /// Disk records idle longer than this are pruned
    pub max_disk_age: Option<Duration>,
    /// Maximum total payload bytes on disk
    pub max_disk_size: Option<u64>,
    /// Maximum number of records on disk
    pub max_disk_count: Option<usize>,
    /// Size pruning never drops below this fraction of the bytes it started with
    pub min_retained_fraction: f64,
    /// Additional directories consulted, in order, on a disk miss
    pub read_only_paths: Vec<PathBuf>,
    /// Interval between background memory trims
    pub memory_trim_interval: Duration,
    /// Interval between background disk prunes
    pub disk_trim_interval: Duration,
}

impl CacheConfig {
    /// Creates a config rooted at `directory` with default limits.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `IMAGE_CACHE_DIR` - Root directory (default: ./image-cache)
    /// - `IMAGE_CACHE_NAMESPACE` - Namespace subdirectory (default: default)
    /// - `IMAGE_CACHE_MEMORY_ENABLED` / `IMAGE_CACHE_DISK_ENABLED` (default: true)
    /// - `IMAGE_CACHE_MAX_MEMORY_COST` - Bytes, 0 = unlimited (default: 0)
    /// - `IMAGE_CACHE_MAX_MEMORY_COUNT` - Entries, 0 = unlimited (default: 0)
    /// - `IMAGE_CACHE_MAX_MEMORY_AGE` - Seconds, 0 = unlimited (default: 0)
    /// - `IMAGE_CACHE_MAX_DISK_AGE` - Seconds, 0 = unlimited (default: 604800)
    /// - `IMAGE_CACHE_MAX_DISK_SIZE` - Bytes, 0 = unlimited (default: 0)
    /// - `IMAGE_CACHE_MAX_DISK_COUNT` - Records, 0 = unlimited (default: 0)
    /// - `IMAGE_CACHE_MIN_RETAINED_FRACTION` - 0.0 to 1.0 (default: 0.0)
    /// - `IMAGE_CACHE_READ_ONLY_PATHS` - `:`-separated directories (default: none)
    /// - `IMAGE_CACHE_MEMORY_TRIM_INTERVAL` - Seconds (default: 5)
    /// - `IMAGE_CACHE_DISK_TRIM_INTERVAL` - Seconds (default: 60)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            directory: env::var("IMAGE_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.directory),
            namespace: env::var("IMAGE_CACHE_NAMESPACE").unwrap_or(defaults.namespace),
            memory_enabled: parse_var("IMAGE_CACHE_MEMORY_ENABLED").unwrap_or(true),
            disk_enabled: parse_var("IMAGE_CACHE_DISK_ENABLED").unwrap_or(true),
            max_memory_cost: parse_var("IMAGE_CACHE_MAX_MEMORY_COST").and_then(nonzero),
            max_memory_count: parse_var::<usize>("IMAGE_CACHE_MAX_MEMORY_COUNT")
                .filter(|v| *v > 0),
            max_memory_age: parse_var("IMAGE_CACHE_MAX_MEMORY_AGE")
                .and_then(nonzero)
                .map(Duration::from_secs),
            max_disk_age: parse_var("IMAGE_CACHE_MAX_DISK_AGE")
                .map(|secs: u64| nonzero(secs).map(Duration::from_secs))
                .unwrap_or(defaults.max_disk_age),
            max_disk_size: parse_var("IMAGE_CACHE_MAX_DISK_SIZE").and_then(nonzero),
            max_disk_count: parse_var::<usize>("IMAGE_CACHE_MAX_DISK_COUNT").filter(|v| *v > 0),
            min_retained_fraction: parse_var("IMAGE_CACHE_MIN_RETAINED_FRACTION")
                .unwrap_or(defaults.min_retained_fraction),
            read_only_paths: env::var("IMAGE_CACHE_READ_ONLY_PATHS")
                .map(|v| {
                    v.split(':')
                        .filter(|p| !p.is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_default(),
            memory_trim_interval: parse_var("IMAGE_CACHE_MEMORY_TRIM_INTERVAL")
                .map(Duration::from_secs)
                .unwrap_or(defaults.memory_trim_interval),
            disk_trim_interval: parse_var("IMAGE_CACHE_DISK_TRIM_INTERVAL")
                .map(Duration::from_secs)
                .unwrap_or(defaults.disk_trim_interval),
        }
    }

    /// Directory exclusively owned by the disk store of this namespace.
    pub fn disk_root(&self) -> PathBuf {
        self.directory.join(&self.namespace)
    }

    /// Rejects configurations the stores cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(CacheError::InvalidConfig(
                "namespace must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_retained_fraction) {
            return Err(CacheError::InvalidConfig(format!(
                "min_retained_fraction must be within 0.0..=1.0, got {}",
                self.min_retained_fraction
            )));
        }
        if self.memory_trim_interval.is_zero() || self.disk_trim_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "trim intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./image-cache"),
            namespace: "default".to_string(),
            memory_enabled: true,
            disk_enabled: true,
            max_memory_cost: None,
            max_memory_count: None,
            max_memory_age: None,
            max_disk_age: Some(Duration::from_secs(DEFAULT_MAX_DISK_AGE_SECS)),
            max_disk_size: None,
            max_disk_count: None,
            min_retained_fraction: 0.0,
            read_only_paths: Vec::new(),
            memory_trim_interval: Duration::from_secs(5),
            disk_trim_interval: Duration::from_secs(60),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn nonzero(value: u64) -> Option<u64> {
    (value > 0).then_some(value)
}
