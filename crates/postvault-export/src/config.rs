//! Export configuration, loadable from TOML or JSON.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ExportError, ExportResult};
use crate::preflight::SpacePolicy;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB. Default: 65536 (64 MiB)
    pub mem_cost_kib: u32,
    /// Number of passes. Default: 3
    pub time_cost: u32,
    /// Degree of parallelism. Default: 4
    pub lanes: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 64 * 1024,
            time_cost: 3,
            lanes: 4,
        }
    }
}

impl KdfParams {
    /// Cheapest parameters argon2 accepts; for tests only.
    pub fn insecure_fast() -> Self {
        Self {
            mem_cost_kib: 8 * 1024,
            time_cost: 1,
            lanes: 1,
        }
    }
}

/// Tunables for the export pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Upper bound on copy/encrypt workers; removable media degrade badly past a few.
    pub max_workers: usize,
    /// Files fsynced concurrently during the batched sync pass.
    pub sync_concurrency: usize,
    /// Skip the batched sync pass entirely.
    pub skip_sync: bool,
    /// Safety margin applied to the estimated export size, in percent.
    pub space_margin_pct: u32,
    /// Fixed free-space headroom in bytes.
    pub space_headroom_bytes: u64,
    /// Argon2id parameters for password-based exports.
    pub kdf: KdfParams,
    /// Where the crash-visible export snapshot is kept.
    pub state_path: PathBuf,
    /// Directory with platform viewer binaries copied into each export.
    pub viewer_dir: Option<PathBuf>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            sync_concurrency: 8,
            skip_sync: false,
            space_margin_pct: 10,
            space_headroom_bytes: 256 * 1024 * 1024,
            kdf: KdfParams::default(),
            state_path: PathBuf::from("/var/lib/postvault/export-state.json"),
            viewer_dir: None,
        }
    }
}

impl ExportConfig {
    /// Loads a config file; the format is chosen by extension.
    pub fn from_file(path: &Path) -> ExportResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ExportError::Config(e.to_string())),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => Err(ExportError::Config(format!(
                "Unsupported config file extension: {}",
                ext
            ))),
        }
    }

    /// Worker count actually used: `min(available_parallelism, max_workers)`, at least one.
    pub fn effective_workers(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cpus.min(self.max_workers).max(1)
    }

    /// Space policy derived from the margin and headroom settings.
    pub fn space_policy(&self) -> SpacePolicy {
        SpacePolicy {
            margin_pct: self.space_margin_pct,
            headroom_bytes: self.space_headroom_bytes,
        }
    }
}
