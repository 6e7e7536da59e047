//! Crash-visible snapshot of the export job.
//!
//! The snapshot is rewritten after every phase transition and on shutdown.
//! An export found in a non-terminal phase at startup was interrupted; it is
//! never resumed, only reported as failed.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::error::ExportResult;
use crate::job::{ExportStatus, Phase};
use crate::ports::EventSink;

/// Error recorded on an export that was interrupted by a restart.
pub const INTERRUPTED_ERROR: &str = "export was interrupted by a restart and cannot resume";

/// Export id and terminal flag of the last snapshot written.
#[derive(Debug, Default)]
struct LastSaved {
    export_id: String,
    terminal: bool,
}

/// File-backed store for the [`ExportStatus`] snapshot.
///
/// Clones share one write lock, so saves from the caller, the run task and
/// the supervisor never interleave on the temp file.
#[derive(Debug, Clone)]
pub struct ExportStateStore {
    path: PathBuf,
    last: Arc<Mutex<Option<LastSaved>>>,
}

impl ExportStateStore {
    /// Store keeping its snapshot at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Snapshot location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replaces the snapshot (write to temp file, sync, rename).
    ///
    /// A non-terminal snapshot of an export whose terminal snapshot was
    /// already written is stale and skipped.
    pub fn save(&self, status: &ExportStatus) -> ExportResult<()> {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(prev) = last.as_ref() {
            if prev.terminal && prev.export_id == status.export_id && !status.phase.is_terminal() {
                debug!(export_id = %status.export_id, phase = %status.phase, "skipping stale export state");
                return Ok(());
            }
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_vec_pretty(status)?;

        let mut tmp_path = self.path.clone();
        tmp_path.set_extension("tmp");
        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(&encoded)?;
            tmp_file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        *last = Some(LastSaved {
            export_id: status.export_id.clone(),
            terminal: status.phase.is_terminal(),
        });
        Ok(())
    }

    /// Reads the snapshot as stored, `None` when absent.
    pub fn load(&self) -> ExportResult<Option<ExportStatus>> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Loads the snapshot at process start.
    ///
    /// A non-terminal snapshot is rewritten as `failed` with
    /// [`INTERRUPTED_ERROR`] and reported through `events`. A corrupt snapshot
    /// is discarded.
    pub fn load_on_startup(&self, events: &dyn EventSink) -> ExportResult<Option<ExportStatus>> {
        let mut status = match self.load() {
            Ok(Some(status)) => status,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "discarding unreadable export state");
                let _ = fs::remove_file(&self.path);
                return Ok(None);
            }
        };

        if !status.phase.is_terminal() {
            info!(
                export_id = %status.export_id,
                phase = %status.phase,
                "found interrupted export, marking failed"
            );
            status.phase = Phase::Failed;
            status.error = Some(INTERRUPTED_ERROR.to_string());
            status.current_item = String::new();
            self.save(&status)?;
            events.emit_error(&format!(
                "Export {} to {} was interrupted and cannot resume",
                status.export_id,
                status.dest_path.display()
            ));
        }
        Ok(Some(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ExportOptions;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Errors(Mutex<Vec<String>>);

    impl EventSink for Errors {
        fn emit_info(&self, _: &str) {}
        fn emit_warning(&self, _: &str) {}
        fn emit_error(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
        fn emit_success(&self, _: &str) {}
    }

    fn status(phase: Phase) -> ExportStatus {
        let options = ExportOptions {
            dest_path: PathBuf::from("/media/usb/export"),
            ..Default::default()
        };
        let mut s = ExportStatus::new("exp-7".into(), &options);
        s.phase = phase;
        s.total = 20;
        s.exported = 7;
        s
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExportStateStore::new(dir.path().join("state/export.json"));
        let s = status(Phase::Completed);
        store.save(&s).unwrap();
        assert_eq!(store.load().unwrap(), Some(s));
        assert!(!dir.path().join("state/export.tmp").exists());
    }

    #[test]
    fn test_interrupted_export_becomes_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExportStateStore::new(dir.path().join("export.json"));
        store.save(&status(Phase::Exporting)).unwrap();

        let sink = Errors::default();
        let loaded = store.load_on_startup(&sink).unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::Failed);
        assert!(loaded.error.as_deref().unwrap().contains("cannot resume"));
        assert_eq!(loaded.exported, 7);
        assert_eq!(sink.0.lock().unwrap().len(), 1);

        // The rewrite is durable.
        assert_eq!(store.load().unwrap().unwrap().phase, Phase::Failed);
    }

    #[test]
    fn test_terminal_snapshot_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExportStateStore::new(dir.path().join("export.json"));
        store.save(&status(Phase::Cancelled)).unwrap();
        let sink = Errors::default();
        let loaded = store.load_on_startup(&sink).unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::Cancelled);
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_snapshot_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        fs::write(&path, b"{ not json").unwrap();
        let store = ExportStateStore::new(&path);
        assert_eq!(store.load_on_startup(&Errors::default()).unwrap(), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExportStateStore::new(dir.path().join("none.json"));
        assert_eq!(store.load_on_startup(&Errors::default()).unwrap(), None);
    }

    #[test]
    fn test_stale_snapshot_does_not_replace_terminal_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExportStateStore::new(dir.path().join("export.json"));
        store.save(&status(Phase::Exporting)).unwrap();
        store.clone().save(&status(Phase::Cancelled)).unwrap();
        store.save(&status(Phase::Exporting)).unwrap();
        assert_eq!(store.load().unwrap().unwrap().phase, Phase::Cancelled);

        // A different export starts over.
        let mut next = status(Phase::Preparing);
        next.export_id = "exp-8".into();
        store.save(&next).unwrap();
        assert_eq!(store.load().unwrap().unwrap().export_id, "exp-8");
    }

    #[test]
    fn test_concurrent_saves_leave_a_readable_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExportStateStore::new(dir.path().join("export.json"));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let mut s = status(Phase::Exporting);
                        s.exported = t * 100 + i;
                        s.current_item = "x".repeat((t * 37 + i) as usize % 200);
                        store.save(&s).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::Exporting);
        assert!(!dir.path().join("export.tmp").exists());
    }
}
