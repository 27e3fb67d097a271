//! Shared SHA-256 hex digest utility.
//!
//! Used to derive stable, content-addressed upload names for input images.

use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Content-addressed upload name: the first 32 hex digits of the digest
/// followed by the lowercased extension (if any).
pub fn upload_file_name(data: &[u8], extension: Option<&str>) -> String {
    let digest = sha256_hex(data);
    match extension {
        Some(ext) if !ext.is_empty() => format!("{}.{}", &digest[..32], ext.to_lowercase()),
        _ => digest[..32].to_string(),
    }
}
