//! Obfuscated, deterministic on-disk names for encrypted blobs.
//!
//! `name = hex(sha256(normalized_path)[..16]) + ".enc"`. 128 bits keep the
//! collision probability near `n² / 2^129`; a collision would make two files
//! share one blob, and the later write wins.

use sha2::{Digest, Sha256};

/// Hash bytes kept in a name.
pub const NAME_HASH_BYTES: usize = 16;
/// Suffix appended to every obfuscated name.
pub const NAME_SUFFIX: &str = ".enc";

/// Normalizes a relative path: forward slashes, no leading `./` or `/`.
pub fn normalize_rel_path(rel_path: &str) -> String {
    let slashed = rel_path.replace('\\', "/");
    slashed
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Obfuscated file name for a relative archive path.
pub fn name_for(rel_path: &str) -> String {
    name_with_width(rel_path, NAME_HASH_BYTES)
}

pub(crate) fn name_with_width(rel_path: &str, hash_bytes: usize) -> String {
    let normalized = normalize_rel_path(rel_path);
    let digest = Sha256::digest(normalized.as_bytes());
    let width = hash_bytes.clamp(1, digest.len());
    format!("{}{}", hex::encode(&digest[..width]), NAME_SUFFIX)
}
