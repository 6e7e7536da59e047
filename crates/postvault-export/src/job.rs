//! Export job model: phases, options, status snapshots and the single-flight slot.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ExportError, ExportResult};
use crate::ports::ArchiveItem;

/// Lifecycle phase of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Validating the destination, checking space, deriving the key.
    Preparing,
    /// Copying or encrypting items.
    Exporting,
    /// Syncing, writing index/manifest and auxiliary files.
    Finalizing,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped by the operator.
    Cancelled,
}

impl Phase {
    /// True for `completed`, `failed` and `cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    /// Legal edges of the phase state machine.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Preparing, Exporting)
                | (Exporting, Finalizing)
                | (Finalizing, Completed)
                | (Preparing | Exporting | Finalizing, Failed | Cancelled)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Preparing => "preparing",
            Phase::Exporting => "exporting",
            Phase::Finalizing => "finalizing",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Inclusion filters passed to the item lister.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFilter {
    /// Earliest creation date (inclusive).
    pub since: Option<NaiveDate>,
    /// Latest creation date (inclusive).
    pub until: Option<NaiveDate>,
    /// Author allow-list; empty means everyone.
    pub authors: Vec<String>,
    /// Case-insensitive free-text query over text and author.
    pub query: Option<String>,
}

impl ExportFilter {
    /// Whether an item passes every filter.
    pub fn matches(&self, item: &ArchiveItem) -> bool {
        let date = item.created_at.date_naive();
        if self.since.is_some_and(|since| date < since) {
            return false;
        }
        if self.until.is_some_and(|until| date > until) {
            return false;
        }
        if !self.authors.is_empty()
            && !self
                .authors
                .iter()
                .any(|a| a.eq_ignore_ascii_case(&item.author))
        {
            return false;
        }
        if let Some(query) = self.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let needle = query.to_lowercase();
            if !item.text.to_lowercase().contains(&needle)
                && !item.author.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }
}

/// Caller input; immutable for the run.
#[derive(Clone, Default)]
pub struct ExportOptions {
    /// Destination directory.
    pub dest_path: PathBuf,
    /// Mount point of the target volume, when exporting to removable media.
    pub mount_point: Option<PathBuf>,
    /// Item filters.
    pub filter: ExportFilter,
    /// Encrypt the export.
    pub encrypt: bool,
    /// Password; required iff `encrypt`.
    pub password: Option<String>,
    /// Also write a stored zip bundle next to the destination.
    pub bundle: bool,
}

impl fmt::Debug for ExportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportOptions")
            .field("dest_path", &self.dest_path)
            .field("mount_point", &self.mount_point)
            .field("filter", &self.filter)
            .field("encrypt", &self.encrypt)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("bundle", &self.bundle)
            .finish()
    }
}

impl ExportOptions {
    /// Checks the option combination without touching the filesystem.
    pub fn validate(&self) -> ExportResult<()> {
        if self.dest_path.as_os_str().is_empty() {
            return Err(ExportError::InvalidOptions(
                "destination path is empty".to_string(),
            ));
        }
        let has_password = self.password.as_deref().is_some_and(|p| !p.is_empty());
        if self.encrypt && !has_password {
            return Err(ExportError::InvalidOptions(
                "encryption requested without a password".to_string(),
            ));
        }
        if !self.encrypt && self.password.is_some() {
            return Err(ExportError::InvalidOptions(
                "password given but encryption is not enabled".to_string(),
            ));
        }
        if let (Some(since), Some(until)) = (self.filter.since, self.filter.until) {
            if since > until {
                return Err(ExportError::InvalidOptions(format!(
                    "date range is empty: {} > {}",
                    since, until
                )));
            }
        }
        Ok(())
    }
}

/// Point-in-time copy of an export; also the persisted crash-state schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportStatus {
    /// Unique export id.
    pub export_id: String,
    /// Destination directory.
    pub dest_path: PathBuf,
    /// Mount point of the target volume.
    pub mount_point: Option<PathBuf>,
    /// Current phase.
    pub phase: Phase,
    /// Items selected for export.
    pub total: u64,
    /// Items fully exported.
    pub exported: u64,
    /// Bytes written for successfully exported files.
    pub bytes_written: u64,
    /// Human-readable progress label.
    pub current_item: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Failure message.
    pub error: Option<String>,
    /// Bundle written next to the destination.
    pub bundle_path: Option<PathBuf>,
}

impl ExportStatus {
    /// Fresh status in `preparing`.
    pub fn new(export_id: String, options: &ExportOptions) -> Self {
        Self {
            export_id,
            dest_path: options.dest_path.clone(),
            mount_point: options.mount_point.clone(),
            phase: Phase::Preparing,
            total: 0,
            exported: 0,
            bytes_written: 0,
            current_item: String::new(),
            started_at: Utc::now(),
            error: None,
            bundle_path: None,
        }
    }
}

/// Live state of the active export: status behind a mutex plus the cancellation token.
///
/// Callers only ever get copies of the status.
#[derive(Debug)]
pub struct JobHandle {
    status: Mutex<ExportStatus>,
    cancel: CancellationToken,
    finished: watch::Sender<bool>,
}

impl JobHandle {
    /// Wraps a status in a new handle.
    pub fn new(status: ExportStatus) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            status: Mutex::new(status),
            cancel: CancellationToken::new(),
            finished,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ExportStatus> {
        self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Copy of the current status.
    pub fn snapshot(&self) -> ExportStatus {
        self.lock().clone()
    }

    /// Export id.
    pub fn id(&self) -> String {
        self.lock().export_id.clone()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// Cancellation token observed by the background task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Moves to `next`; terminal jobs never change again.
    pub fn transition(&self, next: Phase) -> ExportResult<ExportStatus> {
        let mut status = self.lock();
        if status.phase.is_terminal() {
            return Err(ExportError::AlreadyFinished {
                phase: status.phase,
            });
        }
        if !status.phase.can_transition_to(next) {
            return Err(ExportError::InvalidOptions(format!(
                "illegal phase transition {} -> {}",
                status.phase, next
            )));
        }
        debug!(export_id = %status.export_id, from = %status.phase, to = %next, "phase transition");
        status.phase = next;
        Ok(status.clone())
    }

    /// Moves to `failed` with a message, unless already terminal.
    pub fn fail(&self, message: impl Into<String>) -> ExportResult<ExportStatus> {
        let mut status = self.lock();
        if status.phase.is_terminal() {
            return Err(ExportError::AlreadyFinished {
                phase: status.phase,
            });
        }
        status.phase = Phase::Failed;
        status.error = Some(message.into());
        Ok(status.clone())
    }

    /// Synchronously moves to `cancelled`, then signals the token.
    pub fn cancel(&self) -> ExportResult<ExportStatus> {
        let snapshot = {
            let mut status = self.lock();
            if status.phase.is_terminal() {
                return Err(ExportError::AlreadyFinished {
                    phase: status.phase,
                });
            }
            status.phase = Phase::Cancelled;
            status.current_item = String::new();
            status.clone()
        };
        self.cancel.cancel();
        Ok(snapshot)
    }

    /// Applies a progress update while the job is not terminal.
    pub fn update<F: FnOnce(&mut ExportStatus)>(&self, f: F) {
        let mut status = self.lock();
        if !status.phase.is_terminal() {
            f(&mut status);
        }
    }

    /// Marks the background task as done.
    pub fn mark_finished(&self) {
        self.finished.send_replace(true);
    }

    /// Whether the background task has returned.
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Waits until the background task has returned.
    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Holder of the one export allowed system-wide.
#[derive(Debug, Default)]
pub struct ActiveExportSlot {
    current: Mutex<Option<Arc<JobHandle>>>,
}

impl ActiveExportSlot {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a new job iff no job is active.
    ///
    /// A job counts as active until it is terminal and its task has finished
    /// cleaning up, so a new run never races a cancelled run's cleanup.
    pub fn try_claim(&self, status: ExportStatus) -> ExportResult<Arc<JobHandle>> {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = current.as_ref() {
            if !existing.phase().is_terminal() || !existing.is_finished() {
                return Err(ExportError::AlreadyInProgress);
            }
        }
        let handle = Arc::new(JobHandle::new(status));
        *current = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// The current (possibly terminal) job.
    pub fn current(&self) -> Option<Arc<JobHandle>> {
        self.current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Installs a terminal job restored from disk, for status queries.
    pub fn restore(&self, status: ExportStatus) {
        let handle = Arc::new(JobHandle::new(status));
        handle.mark_finished();
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn status() -> ExportStatus {
        let options = ExportOptions {
            dest_path: PathBuf::from("/media/usb/export"),
            ..Default::default()
        };
        ExportStatus::new("exp-1".to_string(), &options)
    }

    fn item(author: &str, text: &str, y: i32, m: u32, d: u32) -> ArchiveItem {
        ArchiveItem {
            id: "1".to_string(),
            author: author.to_string(),
            created_at: Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap(),
            text: text.to_string(),
            raw: serde_json::json!({}),
            avatar: None,
            media: vec![],
        }
    }

    #[test]
    fn test_phase_transitions() {
        assert!(Phase::Preparing.can_transition_to(Phase::Exporting));
        assert!(Phase::Exporting.can_transition_to(Phase::Finalizing));
        assert!(Phase::Finalizing.can_transition_to(Phase::Completed));
        assert!(Phase::Preparing.can_transition_to(Phase::Cancelled));
        assert!(Phase::Finalizing.can_transition_to(Phase::Failed));
        assert!(!Phase::Preparing.can_transition_to(Phase::Completed));
        assert!(!Phase::Completed.can_transition_to(Phase::Failed));
        assert!(!Phase::Cancelled.can_transition_to(Phase::Exporting));
    }

    #[test]
    fn test_phase_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Phase::Exporting).unwrap(), "\"exporting\"");
        let p: Phase = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(p, Phase::Cancelled);
    }

    #[test]
    fn test_options_validation() {
        let mut o = ExportOptions::default();
        assert!(o.validate().is_err());
        o.dest_path = PathBuf::from("/tmp/x");
        assert!(o.validate().is_ok());
        o.encrypt = true;
        assert!(o.validate().is_err());
        o.password = Some(String::new());
        assert!(o.validate().is_err());
        o.password = Some("hunter2".into());
        assert!(o.validate().is_ok());
        o.encrypt = false;
        assert!(o.validate().is_err());
    }

    #[test]
    fn test_options_debug_redacts_password() {
        let o = ExportOptions {
            dest_path: PathBuf::from("/tmp/x"),
            encrypt: true,
            password: Some("hunter2".into()),
            ..Default::default()
        };
        assert!(!format!("{:?}", o).contains("hunter2"));
    }

    #[test]
    fn test_filter_matching() {
        let f = ExportFilter {
            since: NaiveDate::from_ymd_opt(2024, 1, 1),
            until: NaiveDate::from_ymd_opt(2024, 12, 31),
            authors: vec!["Alice".into()],
            query: Some("rust".into()),
        };
        assert!(f.matches(&item("alice", "Learning Rust today", 2024, 5, 1)));
        assert!(!f.matches(&item("bob", "Learning Rust today", 2024, 5, 1)));
        assert!(!f.matches(&item("alice", "Learning Go today", 2024, 5, 1)));
        assert!(!f.matches(&item("alice", "rust", 2023, 12, 31)));
        assert!(f.matches(&item("alice", "rust", 2024, 12, 31)));
        assert!(ExportFilter::default().matches(&item("x", "y", 2000, 1, 1)));
    }

    #[test]
    fn test_terminal_job_is_immutable() {
        let job = JobHandle::new(status());
        job.transition(Phase::Exporting).unwrap();
        job.fail("disk gone").unwrap();
        assert!(matches!(
            job.transition(Phase::Finalizing),
            Err(ExportError::AlreadyFinished { phase: Phase::Failed })
        ));
        job.update(|s| s.exported = 99);
        assert_eq!(job.snapshot().exported, 0);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let job = JobHandle::new(status());
        assert!(job.transition(Phase::Completed).is_err());
        assert_eq!(job.phase(), Phase::Preparing);
    }

    #[test]
    fn test_cancel_is_synchronous_and_idempotent() {
        let job = JobHandle::new(status());
        let token = job.cancel_token();
        let snap = job.cancel().unwrap();
        assert_eq!(snap.phase, Phase::Cancelled);
        assert!(token.is_cancelled());
        assert!(matches!(
            job.cancel(),
            Err(ExportError::AlreadyFinished {
                phase: Phase::Cancelled
            })
        ));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let job = JobHandle::new(status());
        let mut snap = job.snapshot();
        snap.exported = 42;
        assert_eq!(job.snapshot().exported, 0);
    }

    #[test]
    fn test_single_flight_slot() {
        let slot = ActiveExportSlot::new();
        let first = slot.try_claim(status()).unwrap();
        assert!(matches!(
            slot.try_claim(status()),
            Err(ExportError::AlreadyInProgress)
        ));

        first.cancel().unwrap();
        // Terminal but cleanup still running.
        assert!(matches!(
            slot.try_claim(status()),
            Err(ExportError::AlreadyInProgress)
        ));

        first.mark_finished();
        assert!(slot.try_claim(status()).is_ok());
    }

    #[tokio::test]
    async fn test_wait_finished() {
        let job = Arc::new(JobHandle::new(status()));
        let waiter = {
            let job = Arc::clone(&job);
            tokio::spawn(async move { job.wait_finished().await })
        };
        job.mark_finished();
        waiter.await.unwrap();
        assert!(job.is_finished());
    }
}
