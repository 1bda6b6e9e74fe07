//! Error types for the image cache
//!
//! Provides unified error handling using thiserror. A missing key is never an
//! error: lookups return `Option` and callers treat `None` as a miss.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the image cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A file system operation failed
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The disk index disagrees with the directory contents
    #[error("Index corruption: {0}")]
    IndexCorruption(String),

    /// The serialized disk worker has shut down
    #[error("Disk worker is no longer running")]
    WorkerClosed,

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CacheError {
    /// Wraps an `io::Error` with the path it occurred on.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        CacheError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for the image cache.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_carries_path() {
        let err = CacheError::io(
            "/cache/data/abc",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let message = err.to_string();
        assert!(message.contains("/cache/data/abc"));
        assert!(message.contains("denied"));
    }

    #[test]
    fn test_index_corruption_message() {
        let err = CacheError::IndexCorruption("line 3".to_string());
        assert_eq!(err.to_string(), "Index corruption: line 3");
    }
}
