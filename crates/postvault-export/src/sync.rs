//! Batched durability pass over the files written during an export.
//!
//! Syncing every file as it is written is prohibitively slow on exFAT/FAT USB
//! sticks; instead all paths are fsynced at the end with bounded concurrency,
//! followed by every directory between them and the export root.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{ExportError, ExportResult};

/// Default number of concurrent fsyncs.
pub const DEFAULT_SYNC_CONCURRENCY: usize = 8;

/// Counters from one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Files synced.
    pub files_synced: usize,
    /// Directories synced.
    pub dirs_synced: usize,
}

/// Runs the batched sync pass.
#[derive(Debug, Clone, Copy)]
pub struct SyncCoordinator {
    concurrency: usize,
}

impl Default for SyncCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_SYNC_CONCURRENCY)
    }
}

impl SyncCoordinator {
    /// Creates a coordinator allowing `concurrency` fsyncs in flight.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Fsyncs every path, then each distinct directory from the path's parent
    /// up to and including `root`.
    ///
    /// A path outside `root` only gets its parent synced. The token is checked
    /// before starting and before each file; cancellation surfaces as
    /// `ExportError::Cancelled`, never as an I/O error.
    #[instrument(skip(self, paths, cancel), fields(files = paths.len(), root = %root.display()))]
    pub async fn sync_all(
        &self,
        paths: Vec<PathBuf>,
        root: &Path,
        cancel: &CancellationToken,
    ) -> ExportResult<SyncReport> {
        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }

        let mut dirs = BTreeSet::new();
        for path in &paths {
            collect_dirs(path, root, &mut dirs);
        }

        let files_synced = self.sync_batch(paths, cancel, false).await?;
        let dirs_synced = self
            .sync_batch(dirs.into_iter().collect(), cancel, true)
            .await?;

        debug!(files_synced, dirs_synced, "batched sync complete");
        Ok(SyncReport {
            files_synced,
            dirs_synced,
        })
    }

    async fn sync_batch(
        &self,
        paths: Vec<PathBuf>,
        cancel: &CancellationToken,
        directories: bool,
    ) -> ExportResult<usize> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();

        for path in paths {
            if cancel.is_cancelled() {
                set.abort_all();
                return Err(ExportError::Cancelled);
            }
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => permit
                    .map_err(|e| ExportError::Io(std::io::Error::other(e)))?,
                _ = cancel.cancelled() => {
                    set.abort_all();
                    return Err(ExportError::Cancelled);
                }
            };
            set.spawn_blocking(move || {
                let _permit = permit;
                sync_path(&path, directories)
            });
        }

        let mut synced = 0;
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => synced += 1,
                Ok(Err(e)) => {
                    warn!(error = %e, "fsync failed");
                    first_error.get_or_insert(ExportError::Io(e));
                }
                Err(e) => {
                    first_error.get_or_insert(ExportError::Io(std::io::Error::other(e)));
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(synced),
        }
    }
}

/// New directory entries only survive power loss once every directory that
/// holds them is synced, so walk up to the root.
fn collect_dirs(path: &Path, root: &Path, dirs: &mut BTreeSet<PathBuf>) {
    let Some(parent) = path.parent() else {
        return;
    };
    if !parent.starts_with(root) {
        dirs.insert(parent.to_path_buf());
        return;
    }
    for dir in parent.ancestors() {
        if !dirs.insert(dir.to_path_buf()) || dir == root {
            break;
        }
    }
}

fn sync_path(path: &Path, directory: bool) -> std::io::Result<()> {
    let file = File::open(path)?;
    match file.sync_all() {
        Ok(()) => Ok(()),
        // Some platforms and filesystems (FAT via some drivers) refuse fsync on directories.
        Err(e) if directory => {
            debug!(path = %path.display(), error = %e, "directory fsync unsupported");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
