//! Error types for the export pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::job::Phase;
use crate::preflight::format_bytes;

/// Result type alias for export operations.
pub type ExportResult<T> = Result<T, ExportError>;

/// All errors that can occur while preparing, running or restoring an export.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The export options are inconsistent (empty destination, missing password, ...).
    #[error("Invalid export options: {0}")]
    InvalidOptions(String),

    /// The destination holds files that were not produced by a previous export.
    #[error("Destination {path} contains unrelated files: {foreign:?}")]
    DestinationConflict {
        /// Destination directory.
        path: PathBuf,
        /// Names of the foreign entries found.
        foreign: Vec<String>,
    },

    /// The destination cannot be created or written to.
    #[error("Destination {path} is not writable: {reason}")]
    DestinationUnwritable {
        /// Destination directory.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// The target volume does not have room for the export.
    #[error(
        "Insufficient space: export needs {} but only {} is available",
        format_bytes(*required),
        format_bytes(*available)
    )]
    InsufficientSpace {
        /// Bytes required including margin and headroom.
        required: u64,
        /// Bytes free on the target volume.
        available: u64,
    },

    /// Password-based key derivation failed.
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// AEAD encryption failed.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// A chunk failed authentication: wrong password, tampering or corruption.
    #[error("Decryption failed: authentication tag mismatch in chunk {chunk} (data may be corrupted or tampered)")]
    DecryptionAuthFailed {
        /// Zero-based index of the rejected chunk.
        chunk: u64,
    },

    /// The encrypted stream is structurally invalid.
    #[error("Corrupt encrypted stream: {0}")]
    CorruptStream(String),

    /// The stream did not contain the number of chunks recorded in the manifest.
    #[error("Chunk count mismatch: manifest records {expected}, stream holds {actual}")]
    ChunkCountMismatch {
        /// Chunk count from the manifest.
        expected: u64,
        /// Chunk count found in the stream.
        actual: u64,
    },

    /// Plain-copy verification found a destination size different from the source.
    #[error("Size mismatch for {path}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        /// Destination file.
        path: PathBuf,
        /// Source size.
        expected: u64,
        /// Destination size after sync.
        actual: u64,
    },

    /// Another export is still active.
    #[error("An export is already in progress")]
    AlreadyInProgress,

    /// No export has been started.
    #[error("No export is active")]
    NoActiveExport,

    /// The export already reached a terminal phase.
    #[error("Export already finished with phase {phase}")]
    AlreadyFinished {
        /// Terminal phase of the export.
        phase: Phase,
    },

    /// The export was cancelled. Not a failure; surfaces as the `cancelled` phase.
    #[error("Export cancelled")]
    Cancelled,

    /// Mount point validation failed.
    #[error("Volume error: {0}")]
    Volume(String),

    /// Bundle creation failed.
    #[error("Bundle error: {0}")]
    Bundle(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExportError {
    /// True for the cancellation variant, so callers never match on messages.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExportError::Cancelled)
    }
}

impl From<zip::result::ZipError> for ExportError {
    fn from(e: zip::result::ZipError) -> Self {
        ExportError::Bundle(e.to_string())
    }
}
