#![warn(missing_docs)]

//! PostVault export subsystem: portable, optionally encrypted exports of a post archive.
//!
//! Plain:     List → Preflight → Copy + verify (per file) → Batched sync → Index
//! Encrypted: List → Preflight → Derive key → Encrypt to obfuscated blobs → Batched sync → Manifest

pub mod bundle;
pub mod cipher;
pub mod cli;
pub mod config;
pub mod context;
pub mod copier;
pub mod error;
pub mod job;
pub mod layout;
pub mod manifest;
pub mod namer;
pub mod orchestrator;
pub mod pool;
pub mod ports;
pub mod preflight;
pub mod restore;
pub mod state_store;
pub mod sync;

pub use bundle::{write_bundle, BundleReport};
pub use cipher::{
    decrypt_stream, derive_key, encrypt_stream, KeyMaterial, StreamHeader, StreamStats, CHUNK_SIZE,
};
pub use config::{ExportConfig, KdfParams};
pub use context::EncryptionContext;
pub use copier::{CopyReport, CopySource, StreamCopier};
pub use error::{ExportError, ExportResult};
pub use job::{ActiveExportSlot, ExportFilter, ExportOptions, ExportStatus, JobHandle, Phase};
pub use manifest::{Manifest, ManifestBuilder, ManifestEntry};
pub use namer::name_for;
pub use orchestrator::{ExportOrchestrator, ExportPorts};
pub use pool::{TaskOutcome, WorkerPool};
pub use ports::{
    ArchiveDirLister, ArchiveItem, EventSink, InMemoryLister, ItemLister, MountTableLister,
    OsSpaceGauge, SpaceGauge, StaticVolumeLister, TracingEventSink, Volume, VolumeLister,
};
pub use preflight::{format_bytes, SpacePolicy};
pub use restore::{restore_export, RestoreReport};
pub use state_store::ExportStateStore;
pub use sync::{SyncCoordinator, SyncReport};
