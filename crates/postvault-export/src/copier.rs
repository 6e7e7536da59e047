//! Per-file work of the export: plain copy with verification, or
//! stream-encryption to an obfuscated blob.

use std::fs::{self, File};
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cipher::encrypt_stream;
use crate::context::EncryptionContext;
use crate::error::{ExportError, ExportResult};
use crate::manifest::ManifestEntry;
use crate::namer::name_for;

/// Where the bytes of one exported file come from.
#[derive(Debug, Clone)]
pub enum CopySource {
    /// A file in the archive.
    File(PathBuf),
    /// Content generated during the export (`tweet.json`, `README.md`).
    Bytes(Vec<u8>),
}

impl CopySource {
    fn open(&self) -> io::Result<(Box<dyn Read + Send + '_>, u64)> {
        match self {
            CopySource::File(path) => {
                let file = File::open(path)?;
                let len = file.metadata()?.len();
                Ok((Box::new(file), len))
            }
            CopySource::Bytes(bytes) => Ok((Box::new(Cursor::new(bytes.as_slice())), bytes.len() as u64)),
        }
    }

    fn describe(&self) -> String {
        match self {
            CopySource::File(path) => path.display().to_string(),
            CopySource::Bytes(bytes) => format!("<generated {} bytes>", bytes.len()),
        }
    }
}

/// A file that was written completely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyReport {
    /// Written path.
    pub path: PathBuf,
    /// Bytes counted towards `bytes_written`.
    pub bytes_written: u64,
}

/// Reader that fails once the token fires, so long copies stop between reads.
struct CancellableReader<'a, R> {
    inner: R,
    cancel: &'a CancellationToken,
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("export cancelled"));
        }
        self.inner.read(buf)
    }
}

/// Copies or encrypts single files on behalf of the worker pool.
///
/// Blocking; callers run it on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct StreamCopier {
    cancel: CancellationToken,
}

impl StreamCopier {
    /// Creates a copier observing `cancel`.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    fn check_cancel(&self) -> ExportResult<()> {
        if self.cancel.is_cancelled() {
            Err(ExportError::Cancelled)
        } else {
            Ok(())
        }
    }

    // Cancellation wins over whatever error the interrupted I/O produced.
    fn classify(&self, err: ExportError) -> ExportError {
        if self.cancel.is_cancelled() {
            ExportError::Cancelled
        } else {
            err
        }
    }

    /// Copies `source` to `dest`, syncs it before closing, then re-stats it
    /// and compares the size with the source.
    ///
    /// A partial or mismatching destination file is removed.
    pub fn copy_plain(&self, source: &CopySource, dest: &Path) -> ExportResult<CopyReport> {
        self.check_cancel()?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        match self.copy_and_verify(source, dest) {
            Ok(report) => Ok(report),
            Err(e) => {
                discard(dest);
                Err(self.classify(e))
            }
        }
    }

    fn copy_and_verify(&self, source: &CopySource, dest: &Path) -> ExportResult<CopyReport> {
        let (reader, expected) = source.open()?;
        let mut reader = CancellableReader {
            inner: reader,
            cancel: &self.cancel,
        };
        let mut file = File::create(dest)?;
        let copied = io::copy(&mut reader, &mut file)?;
        file.sync_all()?;
        drop(file);

        let actual = fs::metadata(dest)?.len();
        if actual != expected || copied != expected {
            return Err(ExportError::SizeMismatch {
                path: dest.to_path_buf(),
                expected,
                actual,
            });
        }
        debug!(src = %source.describe(), dest = %dest.display(), bytes = actual, "copied");
        Ok(CopyReport {
            path: dest.to_path_buf(),
            bytes_written: actual,
        })
    }

    /// Stream-encrypts `source` into `<out_dir>/<name_for(rel_path)>` and records
    /// the manifest entry once the blob is complete.
    ///
    /// The returned byte count is the ciphertext size on disk. On failure the
    /// partial blob is removed and nothing is recorded.
    pub fn encrypt_to_blob(
        &self,
        ctx: &EncryptionContext,
        rel_path: &str,
        source: &CopySource,
    ) -> ExportResult<CopyReport> {
        self.check_cancel()?;
        let name = name_for(rel_path);
        let blob = ctx.out_dir().join(&name);

        let stats = match self.encrypt_into(ctx, source, &blob) {
            Ok(stats) => stats,
            Err(e) => {
                discard(&blob);
                return Err(self.classify(e));
            }
        };

        let entry = ManifestEntry::new(rel_path, name, stats.bytes_read);
        if entry.chunk_count != stats.chunk_count {
            discard(&blob);
            return Err(ExportError::ChunkCountMismatch {
                expected: entry.chunk_count,
                actual: stats.chunk_count,
            });
        }
        ctx.record_success(rel_path, entry, blob.clone());
        debug!(rel_path, chunks = stats.chunk_count, bytes = stats.bytes_written, "encrypted");
        Ok(CopyReport {
            path: blob,
            bytes_written: stats.bytes_written,
        })
    }

    fn encrypt_into(
        &self,
        ctx: &EncryptionContext,
        source: &CopySource,
        blob: &Path,
    ) -> ExportResult<crate::cipher::StreamStats> {
        let (reader, expected) = source.open()?;
        let mut reader = CancellableReader {
            inner: reader,
            cancel: &self.cancel,
        };
        let mut writer = BufWriter::new(File::create(blob)?);
        let stats = encrypt_stream(ctx.key(), &mut reader, &mut writer)?;
        writer.flush()?;
        if stats.bytes_read != expected {
            return Err(ExportError::SizeMismatch {
                path: blob.to_path_buf(),
                expected,
                actual: stats.bytes_read,
            });
        }
        Ok(stats)
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove partial file");
        }
    }
}
