//! Export orchestrator: the phase state machine driving one export at a time.
//!
//! `start_export` awaits the preparation step (options, mount point, listing,
//! space preflight, destination) on the blocking pool so the caller gets those
//! errors directly. Key derivation, the item fan-out and finalization then run
//! in a background task; a supervisor makes sure the job always ends in a
//! terminal phase.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::bundle::write_bundle;
use crate::cipher::{derive_key, encrypt_bytes};
use crate::config::ExportConfig;
use crate::context::EncryptionContext;
use crate::copier::{CopySource, StreamCopier};
use crate::error::{ExportError, ExportResult};
use crate::job::{ActiveExportSlot, ExportOptions, ExportStatus, JobHandle, Phase};
use crate::layout::{self, ExportMetadata, ExportedItem, TweetsData};
use crate::manifest::ManifestEntry;
use crate::pool::WorkerPool;
use crate::ports::{ArchiveItem, EventSink, ItemLister, SpaceGauge, VolumeLister};
use crate::preflight::{format_bytes, SpacePolicy};
use crate::state_store::ExportStateStore;
use crate::sync::SyncCoordinator;

/// Error recorded when the export task ends without reaching a terminal phase.
pub const UNEXPECTED_EXIT_ERROR: &str = "export task exited unexpectedly";

/// Collaborators the orchestrator consumes.
#[derive(Clone)]
pub struct ExportPorts {
    /// Source of archived items.
    pub lister: Arc<dyn ItemLister>,
    /// Operator notifications.
    pub events: Arc<dyn EventSink>,
    /// Size estimate and free space.
    pub space: Arc<dyn SpaceGauge>,
    /// Mounted volumes.
    pub volumes: Arc<dyn VolumeLister>,
}

/// Runs exports and answers status queries.
pub struct ExportOrchestrator {
    config: ExportConfig,
    ports: ExportPorts,
    store: ExportStateStore,
    slot: ActiveExportSlot,
}

impl ExportOrchestrator {
    /// Creates an orchestrator persisting its state at `config.state_path`.
    pub fn new(config: ExportConfig, ports: ExportPorts) -> Self {
        let store = ExportStateStore::new(config.state_path.clone());
        Self {
            config,
            ports,
            store,
            slot: ActiveExportSlot::new(),
        }
    }

    /// Loads the persisted snapshot, failing an interrupted export, and makes
    /// it visible through [`status`](Self::status).
    pub fn recover_on_startup(&self) -> ExportResult<Option<ExportStatus>> {
        let recovered = self.store.load_on_startup(self.ports.events.as_ref())?;
        if let Some(status) = &recovered {
            self.slot.restore(status.clone());
        }
        Ok(recovered)
    }

    /// Starts an export.
    ///
    /// Fails with `AlreadyInProgress` while another export is active. Option,
    /// mount, listing, space and destination errors fail the new job and are
    /// returned here; nothing is written at the destination in that case.
    #[instrument(skip(self, options), fields(dest = %options.dest_path.display(), encrypt = options.encrypt))]
    pub async fn start_export(&self, options: ExportOptions) -> ExportResult<ExportStatus> {
        let export_id = Uuid::new_v4().to_string();
        let job = self
            .slot
            .try_claim(ExportStatus::new(export_id.clone(), &options))?;
        let initial = job.snapshot();
        persist(&self.store, &initial);
        self.ports.events.progress(&initial);
        self.ports.events.emit_info(&format!(
            "Export {} to {} started",
            export_id,
            options.dest_path.display()
        ));

        let prepared = {
            let ports = self.ports.clone();
            let policy = self.config.space_policy();
            let job = Arc::clone(&job);
            let options = options.clone();
            tokio::task::spawn_blocking(move || prepare(&ports, policy, &job, &options))
                .await
                .map_err(join_error)
                .and_then(|r| r)
        };
        let items = match prepared {
            Ok(items) => items,
            Err(e) => {
                let message = e.to_string();
                if let Ok(status) = job.fail(message.clone()) {
                    persist(&self.store, &status);
                    self.ports.events.progress(&status);
                    self.ports
                        .events
                        .emit_error(&format!("Export {} failed: {}", export_id, message));
                }
                job.mark_finished();
                return Err(e);
            }
        };

        let run = ExportRun {
            job: Arc::clone(&job),
            options,
            config: self.config.clone(),
            events: Arc::clone(&self.ports.events),
            store: self.store.clone(),
        };
        let task = tokio::spawn(run.run(items));
        tokio::spawn(supervise(
            task,
            Arc::clone(&job),
            self.store.clone(),
            Arc::clone(&self.ports.events),
        ));

        Ok(job.snapshot())
    }

    /// Copy of the current (or last) export's status.
    pub fn status(&self) -> ExportResult<ExportStatus> {
        self.slot
            .current()
            .map(|job| job.snapshot())
            .ok_or(ExportError::NoActiveExport)
    }

    /// Cancels the active export.
    ///
    /// The job is `cancelled` when this returns; artifact cleanup follows in
    /// the background. Cancelling a terminal export fails with `AlreadyFinished`.
    pub fn cancel(&self) -> ExportResult<ExportStatus> {
        let job = self.slot.current().ok_or(ExportError::NoActiveExport)?;
        let status = job.cancel()?;
        persist(&self.store, &status);
        self.ports.events.progress(&status);
        self.ports
            .events
            .emit_info(&format!("Cancelling export {}", status.export_id));
        Ok(status)
    }

    /// Waits for the current export's background task, then returns its status.
    pub async fn wait(&self) -> ExportResult<ExportStatus> {
        let job = self.slot.current().ok_or(ExportError::NoActiveExport)?;
        job.wait_finished().await;
        Ok(job.snapshot())
    }

    /// Persists the current snapshot and stops a running export.
    pub async fn shutdown(&self) {
        let Some(job) = self.slot.current() else {
            return;
        };
        persist(&self.store, &job.snapshot());
        if !job.phase().is_terminal() {
            info!(export_id = %job.id(), "shutting down, cancelling active export");
            if let Err(e) = self.cancel() {
                debug!(error = %e, "export finished before shutdown could cancel it");
            }
        }
        job.wait_finished().await;
        // The first save may have raced the run's own terminal save.
        persist(&self.store, &job.snapshot());
    }
}

/// Validation, listing, space preflight and destination setup. Blocking.
fn prepare(
    ports: &ExportPorts,
    policy: SpacePolicy,
    job: &JobHandle,
    options: &ExportOptions,
) -> ExportResult<Vec<ArchiveItem>> {
    options.validate()?;
    if let Some(mount) = &options.mount_point {
        validate_mount(ports.volumes.as_ref(), mount, &options.dest_path)?;
    }

    job.update(|s| s.current_item = "listing items".to_string());
    let (items, listed_total) = ports.lister.list(&options.filter)?;
    debug!(selected = items.len(), listed_total, "items selected for export");
    let total = items.len() as u64;
    job.update(|s| {
        s.total = total;
        s.current_item = "checking free space".to_string();
    });

    let estimated = ports.space.estimate_bytes(&items);
    let available = ports.space.available_bytes(&options.dest_path)?;
    let required = policy.check(estimated, available)?;
    info!(
        estimated = %format_bytes(estimated),
        required = %format_bytes(required),
        available = %format_bytes(available),
        "space preflight passed"
    );

    layout::prepare_destination(&options.dest_path)?;
    Ok(items)
}

fn validate_mount(volumes: &dyn VolumeLister, mount: &Path, dest: &Path) -> ExportResult<()> {
    if !volumes.list_volumes()?.iter().any(|v| v.mount_point == mount) {
        return Err(ExportError::Volume(format!(
            "{} is not a mounted volume",
            mount.display()
        )));
    }
    if !dest.starts_with(mount) {
        return Err(ExportError::Volume(format!(
            "destination {} is not on volume {}",
            dest.display(),
            mount.display()
        )));
    }
    Ok(())
}

fn persist(store: &ExportStateStore, status: &ExportStatus) {
    if let Err(e) = store.save(status) {
        warn!(path = %store.path().display(), error = %e, "failed to persist export state");
    }
}

fn join_error(e: JoinError) -> ExportError {
    ExportError::Io(io::Error::other(e))
}

async fn supervise(
    task: JoinHandle<()>,
    job: Arc<JobHandle>,
    store: ExportStateStore,
    events: Arc<dyn EventSink>,
) {
    if let Err(e) = task.await {
        error!(export_id = %job.id(), error = %e, "export task aborted");
    }
    if !job.phase().is_terminal() {
        if let Ok(status) = job.fail(UNEXPECTED_EXIT_ERROR) {
            persist(&store, &status);
            events.progress(&status);
            events.emit_error(&format!(
                "Export {} failed: {}",
                status.export_id, UNEXPECTED_EXIT_ERROR
            ));
        }
    }
    job.mark_finished();
}

#[derive(Clone)]
enum ExportMode {
    Plain,
    Encrypted(Arc<EncryptionContext>),
}

#[derive(Debug, Default, Clone, Copy)]
struct ItemReport {
    files_ok: usize,
    files_failed: usize,
    bytes: u64,
}

/// Per-item work shared by the pool workers.
struct ItemExporter {
    dest: PathBuf,
    mode: ExportMode,
    copier: StreamCopier,
    job: Arc<JobHandle>,
    events: Arc<dyn EventSink>,
    skip_sync: bool,
    pending_sync: Mutex<Vec<PathBuf>>,
    exported: Mutex<Vec<(usize, ExportedItem)>>,
}

impl ItemExporter {
    fn export_item(&self, index: usize, item: ArchiveItem) -> ExportResult<ItemReport> {
        let dir = layout::item_dir(&item);
        let label = format!("@{} {}", item.author, item.id);
        self.job.update(|s| s.current_item = label.clone());

        let mut files = vec![
            (
                "tweet.json".to_string(),
                CopySource::Bytes(serde_json::to_vec_pretty(&item.raw)?),
            ),
            (
                "README.md".to_string(),
                CopySource::Bytes(layout::render_item_readme(&item).into_bytes()),
            ),
        ];
        if let Some(avatar) = &item.avatar {
            files.push(("avatar.jpg".to_string(), CopySource::File(avatar.clone())));
        }
        for media in &item.media {
            let Some(name) = media.file_name() else {
                continue;
            };
            let name = layout::sanitize_component(&name.to_string_lossy());
            files.push((format!("media/{}", name), CopySource::File(media.clone())));
        }

        let mut report = ItemReport::default();
        let mut written = Vec::with_capacity(files.len());
        for (name, source) in &files {
            let rel = format!("{}/{}", dir, name);
            let result = match &self.mode {
                ExportMode::Plain => self.copier.copy_plain(source, &self.dest.join(&rel)),
                ExportMode::Encrypted(ctx) => self.copier.encrypt_to_blob(ctx, &rel, source),
            };
            match result {
                Ok(copied) => {
                    report.files_ok += 1;
                    report.bytes += copied.bytes_written;
                    if matches!(self.mode, ExportMode::Plain) && !self.skip_sync {
                        self.pending_sync
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .push(copied.path);
                    }
                    written.push(name.as_str());
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    report.files_failed += 1;
                    warn!(file = %rel, error = %e, "file export failed, skipping");
                    self.events
                        .emit_warning(&format!("Skipped {}: {}", rel, e));
                }
            }
        }

        if written.contains(&"tweet.json") {
            let exported = ExportedItem {
                id: item.id.clone(),
                author: item.author.clone(),
                created_at: item.created_at,
                text: item.text.clone(),
                path: dir.clone(),
                avatar: written
                    .contains(&"avatar.jpg")
                    .then(|| format!("{}/avatar.jpg", dir)),
                media: written
                    .iter()
                    .filter(|n| n.starts_with("media/"))
                    .map(|n| format!("{}/{}", dir, n))
                    .collect(),
                raw: item.raw,
            };
            self.exported
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push((index, exported));
        }

        self.job.update(|s| {
            s.bytes_written += report.bytes;
            if report.files_failed == 0 {
                s.exported += 1;
            }
        });
        self.events.progress(&self.job.snapshot());
        Ok(report)
    }

    fn take_exported(&self) -> Vec<ExportedItem> {
        let mut exported =
            std::mem::take(&mut *self.exported.lock().unwrap_or_else(|p| p.into_inner()));
        exported.sort_by_key(|(index, _)| *index);
        exported.into_iter().map(|(_, item)| item).collect()
    }

    fn take_pending_sync(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.pending_sync.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

/// Background part of one export.
struct ExportRun {
    job: Arc<JobHandle>,
    options: ExportOptions,
    config: ExportConfig,
    events: Arc<dyn EventSink>,
    store: ExportStateStore,
}

impl ExportRun {
    async fn run(self, items: Vec<ArchiveItem>) {
        let cancel = self.job.cancel_token();
        match self.execute(items, &cancel).await {
            Ok(()) => {}
            // Cancellation wins over whatever the interrupted step reported.
            // The phase flips before the token fires, so check both.
            Err(e)
                if e.is_cancelled()
                    || cancel.is_cancelled()
                    || self.job.phase() == Phase::Cancelled =>
            {
                debug!(error = %e, "export stopped by cancellation");
                self.cleanup_cancelled().await;
            }
            Err(e) => self.record_failure(e),
        }
    }

    fn advance(&self, next: Phase) -> ExportResult<()> {
        match self.job.transition(next) {
            Ok(status) => {
                persist(&self.store, &status);
                self.events.progress(&status);
                Ok(())
            }
            Err(ExportError::AlreadyFinished {
                phase: Phase::Cancelled,
            }) => Err(ExportError::Cancelled),
            Err(e) => Err(e),
        }
    }

    async fn execute(
        &self,
        items: Vec<ArchiveItem>,
        cancel: &CancellationToken,
    ) -> ExportResult<()> {
        let dest = self.options.dest_path.clone();

        let mode = if self.options.encrypt {
            self.job
                .update(|s| s.current_item = "deriving encryption key".to_string());
            let password = Zeroizing::new(self.options.password.clone().unwrap_or_default());
            let params = self.config.kdf;
            let key = tokio::task::spawn_blocking(move || derive_key(password.as_bytes(), params))
                .await
                .map_err(join_error)??;
            if cancel.is_cancelled() {
                return Err(ExportError::Cancelled);
            }
            let out_dir = dest.join(layout::ENCRYPTED_DIR);
            fs::create_dir_all(&out_dir)?;
            ExportMode::Encrypted(Arc::new(EncryptionContext::new(
                key,
                out_dir,
                self.config.skip_sync,
            )))
        } else {
            ExportMode::Plain
        };

        self.advance(Phase::Exporting)?;
        let exporter = Arc::new(ItemExporter {
            dest: dest.clone(),
            mode: mode.clone(),
            copier: StreamCopier::new(cancel.clone()),
            job: Arc::clone(&self.job),
            events: Arc::clone(&self.events),
            skip_sync: self.config.skip_sync,
            pending_sync: Mutex::new(Vec::new()),
            exported: Mutex::new(Vec::new()),
        });

        let pool = WorkerPool::new(self.config.effective_workers());
        info!(items = items.len(), workers = pool.workers(), "exporting items");
        let worker = Arc::clone(&exporter);
        let outcomes = pool
            .run(
                items.into_iter().enumerate().collect(),
                cancel,
                move |(index, item)| {
                    let worker = Arc::clone(&worker);
                    async move {
                        tokio::task::spawn_blocking(move || worker.export_item(index, item))
                            .await
                            .map_err(join_error)?
                    }
                },
            )
            .await?;

        let incomplete = outcomes
            .iter()
            .filter(|o| !matches!(&o.result, Ok(r) if r.files_failed == 0))
            .count();
        if incomplete > 0 {
            warn!(incomplete, "some items were not fully exported");
            self.events.emit_warning(&format!(
                "{} of {} items could not be fully exported",
                incomplete,
                outcomes.len()
            ));
        }
        let files_ok: usize = outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .map(|r| r.files_ok)
            .sum();
        debug!(files_ok, "item files written");

        self.advance(Phase::Finalizing)?;
        self.finalize(&exporter, &mode, cancel).await?;

        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        self.advance(Phase::Completed)?;
        let status = self.job.snapshot();
        self.events.emit_success(&format!(
            "Export {} completed: {}/{} items, {} written to {}",
            status.export_id,
            status.exported,
            status.total,
            format_bytes(status.bytes_written),
            status.dest_path.display()
        ));
        Ok(())
    }

    async fn finalize(
        &self,
        exporter: &ItemExporter,
        mode: &ExportMode,
        cancel: &CancellationToken,
    ) -> ExportResult<()> {
        let dest = self.options.dest_path.clone();
        let status = self.job.snapshot();
        let now = Utc::now();
        let items = exporter.take_exported();
        let data = TweetsData {
            exported_at: now,
            count: items.len(),
            items,
        };
        let metadata = ExportMetadata {
            export_id: status.export_id.clone(),
            generator_version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: status.started_at,
            finished_at: now,
            encrypted: self.options.encrypt,
            total_items: status.total,
            exported_items: status.exported,
            bytes_written: status.bytes_written,
            filter: (!self.options.encrypt).then(|| self.options.filter.clone()),
        };

        self.job
            .update(|s| s.current_item = "writing index".to_string());
        let viewer_dir = self.config.viewer_dir.clone();
        let events = Arc::clone(&self.events);
        let artifact_mode = mode.clone();
        let artifact_dest = dest.clone();
        let mut pending = tokio::task::spawn_blocking(move || {
            let mut written = write_index_artifacts(&artifact_dest, &artifact_mode, &data, &metadata)?;
            if let Some(src) = viewer_dir {
                match copy_viewer(&src, &artifact_dest.join(layout::VIEWER_DIR)) {
                    Ok(copied) => written.extend(copied),
                    Err(e) => {
                        warn!(src = %src.display(), error = %e, "viewer binaries not copied");
                        events.emit_warning(&format!("Viewer binaries not copied: {}", e));
                    }
                }
            }
            Ok::<_, ExportError>(written)
        })
        .await
        .map_err(join_error)??;

        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }

        if !self.config.skip_sync {
            pending.extend(exporter.take_pending_sync());
            if let ExportMode::Encrypted(ctx) = mode {
                pending.extend(ctx.take_pending_sync());
            }
            self.job.update(|s| s.current_item = "syncing".to_string());
            let report = SyncCoordinator::new(self.config.sync_concurrency)
                .sync_all(pending, &dest, cancel)
                .await?;
            debug!(files = report.files_synced, dirs = report.dirs_synced, "export synced");
        }

        if self.options.bundle {
            self.job
                .update(|s| s.current_item = "writing bundle".to_string());
            let bundle_path = layout::bundle_path_for(&dest);
            let token = cancel.clone();
            let report = tokio::task::spawn_blocking(move || write_bundle(&dest, &bundle_path, &token))
                .await
                .map_err(join_error)??;
            self.job.update(|s| s.bundle_path = Some(report.path));
        }

        self.job.update(|s| s.current_item = String::new());
        Ok(())
    }

    async fn cleanup_cancelled(&self) {
        // Covers shutdown paths that only fired the token.
        let _ = self.job.cancel();

        let dest = self.options.dest_path.clone();
        let bundle = self.options.bundle.then(|| layout::bundle_path_for(&dest));
        let result = tokio::task::spawn_blocking(move || {
            let removed = layout::remove_artifacts(&dest)?;
            if let Some(bundle) = bundle {
                layout::remove_if_exists(&bundle)?;
            }
            Ok::<_, ExportError>(removed)
        })
        .await
        .map_err(join_error)
        .and_then(|r| r);

        let status = self.job.snapshot();
        persist(&self.store, &status);
        self.events.progress(&status);
        match result {
            Ok(removed) => {
                info!(export_id = %status.export_id, removed, "cancelled export cleaned up");
                self.events
                    .emit_warning(&format!("Export {} cancelled", status.export_id));
            }
            Err(e) => {
                error!(export_id = %status.export_id, error = %e, "cleanup after cancellation failed");
                self.events.emit_error(&format!(
                    "Export {} cancelled but cleanup failed: {}",
                    status.export_id, e
                ));
            }
        }
    }

    fn record_failure(&self, err: ExportError) {
        let message = err.to_string();
        error!(export_id = %self.job.id(), error = %message, "export failed");
        if let Ok(status) = self.job.fail(message.clone()) {
            persist(&self.store, &status);
            self.events.progress(&status);
            self.events
                .emit_error(&format!("Export {} failed: {}", status.export_id, message));
        }
    }
}

fn write_index_artifacts(
    dest: &Path,
    mode: &ExportMode,
    data: &TweetsData,
    metadata: &ExportMetadata,
) -> ExportResult<Vec<PathBuf>> {
    let mut written = Vec::new();
    let mut write = |name: &str, bytes: &[u8]| -> ExportResult<()> {
        let path = dest.join(name);
        fs::write(&path, bytes)?;
        written.push(path);
        Ok(())
    };

    match mode {
        ExportMode::Plain => {
            write(layout::TWEETS_DATA, &serde_json::to_vec_pretty(data)?)?;
            let html = layout::render_index_html(&serde_json::to_string(data)?);
            write(layout::INDEX_HTML, html.as_bytes())?;
            let readme = layout::render_readme(data.count as u64, data.exported_at);
            write(layout::README_TXT, readme.as_bytes())?;
        }
        ExportMode::Encrypted(ctx) => {
            let plain = Zeroizing::new(serde_json::to_vec(data)?);
            write(layout::DATA_ENC, &encrypt_bytes(ctx.key(), &plain)?)?;
            debug!(entries = ctx.entry_count(), "writing manifest");
            let mut manifest = ctx.manifest();
            manifest.data = Some(ManifestEntry::new(
                layout::TWEETS_DATA,
                layout::DATA_ENC.to_string(),
                plain.len() as u64,
            ));
            let manifest_json = Zeroizing::new(manifest.to_json()?);
            write(layout::MANIFEST_ENC, &encrypt_bytes(ctx.key(), &manifest_json)?)?;
            write(
                layout::INDEX_HTML,
                layout::render_encrypted_index_html().as_bytes(),
            )?;
            write(
                layout::README_TXT,
                layout::render_encrypted_readme(data.exported_at).as_bytes(),
            )?;
        }
    }
    write(layout::METADATA_JSON, &serde_json::to_vec_pretty(metadata)?)?;
    Ok(written)
}

fn copy_viewer(src: &Path, dest: &Path) -> ExportResult<Vec<PathBuf>> {
    let mut copied = Vec::new();
    let mut entries: Vec<_> = fs::read_dir(src)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    fs::create_dir_all(dest)?;
    for entry in entries {
        if !entry.file_type()?.is_file() {
            continue;
        }
        let target = dest.join(entry.file_name());
        fs::copy(entry.path(), &target)?;
        copied.push(target);
    }
    debug!(src = %src.display(), files = copied.len(), "viewer binaries copied");
    Ok(copied)
}
