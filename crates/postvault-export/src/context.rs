//! Per-run encryption state shared by the workers.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::cipher::KeyMaterial;
use crate::manifest::{Manifest, ManifestBuilder, ManifestEntry};

/// Key, output directory, manifest and pending-sync list for one encrypted export.
///
/// Workers share the key read-only; the manifest and sync list sit behind mutexes.
#[derive(Debug)]
pub struct EncryptionContext {
    key: KeyMaterial,
    out_dir: PathBuf,
    manifest: ManifestBuilder,
    pending_sync: Mutex<Vec<PathBuf>>,
    skip_sync: bool,
}

impl EncryptionContext {
    /// Creates a context writing blobs into `out_dir`.
    pub fn new(key: KeyMaterial, out_dir: PathBuf, skip_sync: bool) -> Self {
        Self {
            key,
            out_dir,
            manifest: ManifestBuilder::new(),
            pending_sync: Mutex::new(Vec::new()),
            skip_sync,
        }
    }

    /// Derived key material.
    pub fn key(&self) -> &KeyMaterial {
        &self.key
    }

    /// Directory receiving `<obfuscated>.enc` blobs.
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Records a completed file and queues its blob for the batched sync.
    pub fn record_success(&self, rel_path: &str, entry: ManifestEntry, blob: PathBuf) {
        self.manifest.record(rel_path, entry);
        if !self.skip_sync {
            self.enqueue_sync(blob);
        }
    }

    /// Queues an extra path (index, manifest) for the batched sync.
    pub fn enqueue_sync(&self, path: PathBuf) {
        let mut pending = self.pending_sync.lock().unwrap_or_else(|p| p.into_inner());
        pending.push(path);
    }

    /// Drains the pending-sync list.
    pub fn take_pending_sync(&self) -> Vec<PathBuf> {
        let mut pending = self.pending_sync.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::take(&mut *pending)
    }

    /// Number of manifest entries so far.
    pub fn entry_count(&self) -> usize {
        self.manifest.len()
    }

    /// Manifest built so far.
    pub fn manifest(&self) -> Manifest {
        self.manifest.snapshot()
    }
}
