//! Cache file naming.
//!
//! Keys are arbitrary strings (usually URLs); on disk each one becomes the
//! lowercase hex SHA-256 of the key, keeping a short path extension so the
//! files remain recognisable to ordinary image viewers.

use sha2::{Digest, Sha256};

const MAX_EXTENSION_LEN: usize = 5;

/// Deterministic, collision-resistant file name for `key`.
pub fn cache_file_name(key: &str) -> String {
    let mut name = hex::encode(Sha256::digest(key.as_bytes()));
    if let Some(ext) = key_extension(key) {
        name.push('.');
        name.push_str(&ext.to_ascii_lowercase());
    }
    name
}

/// Extension of the last path segment, ignoring any query or fragment.
fn key_extension(key: &str) -> Option<&str> {
    let path = key.split(['?', '#']).next().unwrap_or(key);
    let segment = path.rsplit('/').next()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > MAX_EXTENSION_LEN {
        return None;
    }
    ext.chars().all(|c| c.is_ascii_alphanumeric()).then_some(ext)
}
