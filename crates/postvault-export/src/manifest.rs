//! Manifest of encrypted blobs: original path → obfuscated name and metadata.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::cipher::{chunk_count_for, CHUNK_SIZE};
use crate::error::{ExportError, ExportResult};
use crate::namer::normalize_rel_path;

/// Manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

/// Metadata for one successfully encrypted file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Blob name under `encrypted/`.
    pub encrypted_name: String,
    /// Plaintext size in bytes.
    pub original_size: u64,
    /// Number of AEAD chunks in the blob.
    pub chunk_count: u64,
    /// MIME type guessed from the original name.
    pub content_type: String,
}

impl ManifestEntry {
    /// Builds an entry, computing the chunk count from the size.
    pub fn new(rel_path: &str, encrypted_name: String, original_size: u64) -> Self {
        Self {
            encrypted_name,
            original_size,
            chunk_count: chunk_count_for(original_size),
            content_type: content_type_for(rel_path),
        }
    }
}

/// The serialized manifest (`manifest.enc` plaintext).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Schema version.
    pub version: u32,
    /// Plaintext chunk size used for every blob.
    pub chunk_size: u64,
    /// Entries keyed by normalized relative path.
    pub entries: BTreeMap<String, ManifestEntry>,
    /// `data.enc`, the encrypted `tweets-data.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ManifestEntry>,
}

impl Manifest {
    /// Serializes to JSON bytes.
    pub fn to_json(&self) -> ExportResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parses and validates JSON bytes.
    pub fn from_json(bytes: &[u8]) -> ExportResult<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks version, chunk size and per-entry chunk counts.
    pub fn validate(&self) -> ExportResult<()> {
        if self.version != MANIFEST_VERSION {
            return Err(ExportError::CorruptStream(format!(
                "unsupported manifest version {}",
                self.version
            )));
        }
        if self.chunk_size != CHUNK_SIZE as u64 {
            return Err(ExportError::CorruptStream(format!(
                "manifest chunk size {} does not match {}",
                self.chunk_size, CHUNK_SIZE
            )));
        }
        let data = self.data.as_ref().map(|d| ("data.enc", d));
        for (path, entry) in self.entries.iter().map(|(k, v)| (k.as_str(), v)).chain(data) {
            let expected = chunk_count_for(entry.original_size);
            if entry.chunk_count != expected {
                return Err(ExportError::CorruptStream(format!(
                    "{}: chunk count {} does not match size {}",
                    path, entry.chunk_count, entry.original_size
                )));
            }
        }
        Ok(())
    }
}

/// Thread-safe accumulator shared by the workers of one export run.
///
/// Entries are recorded only after a file has been fully written.
#[derive(Debug, Default)]
pub struct ManifestBuilder {
    entries: Mutex<BTreeMap<String, ManifestEntry>>,
}

impl ManifestBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an entry for a relative path, replacing an earlier one.
    pub fn record(&self, rel_path: &str, entry: ManifestEntry) {
        let key = normalize_rel_path(rel_path);
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(key, entry);
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the current entries into a manifest.
    pub fn snapshot(&self) -> Manifest {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        Manifest {
            version: MANIFEST_VERSION,
            chunk_size: CHUNK_SIZE as u64,
            entries: entries.clone(),
            data: None,
        }
    }
}

/// MIME type for a path, `application/octet-stream` when unknown.
pub fn content_type_for(rel_path: &str) -> String {
    mime_guess::from_path(rel_path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
