//! Downloadable bundle: the finished export packed into one stored zip.
//!
//! Media is already compressed and encrypted blobs do not compress at all,
//! so entries are stored without compression.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{ExportError, ExportResult};

/// Summary of a written bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleReport {
    /// Zip file path.
    pub path: PathBuf,
    /// Files packed.
    pub files: usize,
    /// Size of the zip file.
    pub size: u64,
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(io::Error::other)?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((rel, path));
        }
    }
    Ok(())
}

/// Packs every file under `src_dir` into a stored zip at `bundle_path`.
///
/// A partially written bundle is removed on error or cancellation.
pub fn write_bundle(
    src_dir: &Path,
    bundle_path: &Path,
    cancel: &CancellationToken,
) -> ExportResult<BundleReport> {
    match pack(src_dir, bundle_path, cancel) {
        Ok(report) => {
            info!(path = %report.path.display(), files = report.files, size = report.size, "bundle written");
            Ok(report)
        }
        Err(e) => {
            let _ = fs::remove_file(bundle_path);
            if cancel.is_cancelled() {
                Err(ExportError::Cancelled)
            } else {
                Err(e)
            }
        }
    }
}

fn pack(src_dir: &Path, bundle_path: &Path, cancel: &CancellationToken) -> ExportResult<BundleReport> {
    let mut files = Vec::new();
    collect_files(src_dir, src_dir, &mut files)?;

    let mut zip = ZipWriter::new(BufWriter::new(File::create(bundle_path)?));
    for (name, path) in &files {
        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        let mut src = File::open(path)?;
        let len = src.metadata()?.len();
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .large_file(len >= u32::MAX as u64);
        zip.start_file(name.as_str(), options)?;
        io::copy(&mut src, &mut zip)?;
        debug!(entry = %name, bytes = len, "bundled");
    }

    let writer = zip.finish()?;
    let file = writer
        .into_inner()
        .map_err(|e| ExportError::Io(e.into_error()))?;
    file.sync_all()?;
    let size = file.metadata()?.len();
    Ok(BundleReport {
        path: bundle_path.to_path_buf(),
        files: files.len(),
        size,
    })
}
