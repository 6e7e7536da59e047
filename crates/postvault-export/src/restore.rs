//! Turns an encrypted export back into the plain layout.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{info, instrument};

use crate::cipher::{decrypt_bytes, decrypt_stream, KeyMaterial, StreamHeader};
use crate::error::{ExportError, ExportResult};
use crate::layout::{DATA_ENC, ENCRYPTED_DIR, MANIFEST_ENC, TWEETS_DATA};
use crate::manifest::Manifest;

/// Refuse headers asking Argon2 for more than 4 GiB.
const MAX_RESTORE_MEM_KIB: u32 = 4 * 1024 * 1024;

/// Summary of a restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Files written from `encrypted/`.
    pub files: usize,
    /// Plaintext bytes written for those files.
    pub bytes: u64,
    /// Whether `tweets-data.json` was restored from `data.enc`.
    pub data_restored: bool,
}

fn safe_join(root: &Path, rel: &str) -> ExportResult<PathBuf> {
    let rel_path = Path::new(rel);
    if rel.is_empty()
        || rel_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(ExportError::CorruptStream(format!(
            "manifest path escapes the export: {}",
            rel
        )));
    }
    Ok(root.join(rel_path))
}

/// Derives the key from the manifest header and decrypts the manifest.
pub fn open_manifest(src: &Path, password: &[u8]) -> ExportResult<(KeyMaterial, Manifest)> {
    let bytes = fs::read(src.join(MANIFEST_ENC))?;
    let header = StreamHeader::read_from(&mut bytes.as_slice())?;
    if header.params.mem_cost_kib > MAX_RESTORE_MEM_KIB {
        return Err(ExportError::CorruptStream(format!(
            "unreasonable key derivation memory cost {} KiB",
            header.params.mem_cost_kib
        )));
    }
    let km = KeyMaterial::from_header(password, &header)?;
    let plain = decrypt_bytes(&km, &bytes)?;
    let manifest = Manifest::from_json(&plain)?;
    Ok((km, manifest))
}

/// Decrypts every blob listed in the manifest into `out`, plus `data.enc`
/// into `tweets-data.json` when the manifest records it.
///
/// Each blob, `data.enc` included, must authenticate, hold the recorded chunk
/// count and decrypt to the recorded size.
#[instrument(skip(password), fields(src = %src.display(), out = %out.display()))]
pub fn restore_export(src: &Path, password: &[u8], out: &Path) -> ExportResult<RestoreReport> {
    let (km, manifest) = open_manifest(src, password)?;
    fs::create_dir_all(out)?;

    let mut report = RestoreReport::default();
    for (rel, entry) in &manifest.entries {
        let target = safe_join(out, rel)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let blob = src.join(ENCRYPTED_DIR).join(&entry.encrypted_name);
        let mut reader = BufReader::new(File::open(&blob)?);
        let mut writer = BufWriter::new(File::create(&target)?);
        let stats = decrypt_stream(&km, &mut reader, &mut writer, Some(entry.chunk_count))?;
        writer.flush()?;
        if stats.bytes_written != entry.original_size {
            return Err(ExportError::SizeMismatch {
                path: target,
                expected: entry.original_size,
                actual: stats.bytes_written,
            });
        }
        report.files += 1;
        report.bytes += stats.bytes_written;
    }

    let data_enc = src.join(DATA_ENC);
    match (&manifest.data, data_enc.exists()) {
        (Some(entry), _) => {
            let mut reader = BufReader::new(File::open(&data_enc)?);
            let mut plain = Vec::with_capacity(entry.original_size as usize);
            let stats = decrypt_stream(&km, &mut reader, &mut plain, Some(entry.chunk_count))?;
            if stats.bytes_written != entry.original_size {
                return Err(ExportError::SizeMismatch {
                    path: data_enc,
                    expected: entry.original_size,
                    actual: stats.bytes_written,
                });
            }
            fs::write(out.join(TWEETS_DATA), plain)?;
            report.data_restored = true;
        }
        (None, true) => {
            return Err(ExportError::CorruptStream(format!(
                "{} is not listed in the manifest",
                DATA_ENC
            )));
        }
        (None, false) => {}
    }

    info!(files = report.files, bytes = report.bytes, "export restored");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{derive_key_with_salt, encrypt_bytes, HEADER_LEN};
    use crate::config::KdfParams;
    use crate::context::EncryptionContext;
    use crate::copier::{CopySource, StreamCopier};
    use crate::manifest::ManifestEntry;
    use tokio_util::sync::CancellationToken;

    fn encrypted_export(root: &Path) -> Vec<(String, Vec<u8>)> {
        let km = derive_key_with_salt(b"correct horse", KdfParams::insecure_fast(), [5u8; 16]).unwrap();
        let blobs = root.join(ENCRYPTED_DIR);
        fs::create_dir_all(&blobs).unwrap();
        let ctx = EncryptionContext::new(km.clone(), blobs, true);
        let copier = StreamCopier::new(CancellationToken::new());
        let files = vec![
            ("data/2024/01/a_2024-01-01_1/tweet.json".to_string(), b"{\"id\":\"1\"}".to_vec()),
            ("data/2024/01/a_2024-01-01_1/media/v.bin".to_string(), vec![3u8; 70_000]),
            ("data/2024/01/a_2024-01-01_1/empty.txt".to_string(), Vec::new()),
        ];
        for (rel, data) in &files {
            copier
                .encrypt_to_blob(&ctx, rel, &CopySource::Bytes(data.clone()))
                .unwrap();
        }
        let data = b"{\"count\":1}";
        let mut manifest = ctx.manifest();
        manifest.data = Some(ManifestEntry::new(TWEETS_DATA, DATA_ENC.into(), data.len() as u64));
        let manifest = manifest.to_json().unwrap();
        fs::write(root.join(MANIFEST_ENC), encrypt_bytes(&km, &manifest).unwrap()).unwrap();
        fs::write(root.join(DATA_ENC), encrypt_bytes(&km, data).unwrap()).unwrap();
        files
    }

    #[test]
    fn test_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("export");
        let files = encrypted_export(&src);
        let out = dir.path().join("restored");

        let report = restore_export(&src, b"correct horse", &out).unwrap();
        assert_eq!(report.files, 3);
        assert!(report.data_restored);
        for (rel, data) in files {
            assert_eq!(fs::read(out.join(rel)).unwrap(), data);
        }
        assert_eq!(fs::read(out.join(TWEETS_DATA)).unwrap(), b"{\"count\":1}");
    }

    #[test]
    fn test_wrong_password_fails_authentication() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("export");
        encrypted_export(&src);
        let err = restore_export(&src, b"wrong", &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, ExportError::DecryptionAuthFailed { chunk: 0 }));
    }

    #[test]
    fn test_tampered_blob_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("export");
        encrypted_export(&src);
        let (_, manifest) = open_manifest(&src, b"correct horse").unwrap();
        let entry = &manifest.entries["data/2024/01/a_2024-01-01_1/media/v.bin"];
        let blob = src.join(ENCRYPTED_DIR).join(&entry.encrypted_name);
        let mut bytes = fs::read(&blob).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&blob, bytes).unwrap();

        let err = restore_export(&src, b"correct horse", &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, ExportError::DecryptionAuthFailed { .. }));
    }

    #[test]
    fn test_data_cut_to_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("export");
        encrypted_export(&src);
        let bytes = fs::read(src.join(DATA_ENC)).unwrap();
        fs::write(src.join(DATA_ENC), &bytes[..HEADER_LEN]).unwrap();

        let out = dir.path().join("out");
        let err = restore_export(&src, b"correct horse", &out).unwrap_err();
        assert!(matches!(
            err,
            ExportError::ChunkCountMismatch {
                expected: 1,
                actual: 0
            }
        ));
        assert!(!out.join(TWEETS_DATA).exists());
    }

    #[test]
    fn test_unlisted_data_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("export");
        encrypted_export(&src);
        let (km, mut manifest) = open_manifest(&src, b"correct horse").unwrap();
        manifest.data = None;
        let json = manifest.to_json().unwrap();
        fs::write(src.join(MANIFEST_ENC), encrypt_bytes(&km, &json).unwrap()).unwrap();

        let err = restore_export(&src, b"correct horse", &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, ExportError::CorruptStream(_)));
    }

    #[test]
    fn test_path_escape_rejected() {
        assert!(safe_join(Path::new("/out"), "../etc/passwd").is_err());
        assert!(safe_join(Path::new("/out"), "/etc/passwd").is_err());
        assert!(safe_join(Path::new("/out"), "data/a.json").is_ok());
    }
}
