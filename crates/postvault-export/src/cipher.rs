//! Chunked AES-256-GCM stream encryption with Argon2id password derivation.
//!
//! Layout of an encrypted file:
//!
//! ```text
//! header (40 bytes, bound as associated data of every chunk)
//!   magic "PVX1" | version u8 | m_cost u32 LE | t_cost u32 LE | lanes u32 LE
//!   | kdf salt [16] | nonce prefix [7]
//! chunk*
//!   len u32 LE | ciphertext + 16-byte tag
//! ```
//!
//! Chunk nonces are `prefix | counter u32 BE | last flag`, so dropping,
//! reordering or appending chunks fails authentication. An empty input
//! produces the header and no chunks.

use std::io::{self, Read, Write};

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit};
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, instrument};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::KdfParams;
use crate::error::{ExportError, ExportResult};

/// Plaintext bytes per chunk (1 MiB). Recorded in the manifest.
pub const CHUNK_SIZE: usize = 1024 * 1024;
/// File magic for encrypted blobs.
pub const MAGIC: &[u8; 4] = b"PVX1";
/// Current wire format version.
pub const FORMAT_VERSION: u8 = 1;
/// Length of the password salt.
pub const SALT_LEN: usize = 16;
/// Length of the per-file nonce prefix.
pub const NONCE_PREFIX_LEN: usize = 7;
/// AEAD authentication tag length.
pub const TAG_LEN: usize = 16;
/// Serialized header length.
pub const HEADER_LEN: usize = 4 + 1 + 12 + SALT_LEN + NONCE_PREFIX_LEN;

const HKDF_INFO: &[u8] = b"postvault-export-chunk-key-v1";

/// 256-bit AEAD key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; 32]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// Key derived once per export run, plus the parameters needed to re-derive it.
#[derive(Clone)]
pub struct KeyMaterial {
    key: EncryptionKey,
    salt: [u8; SALT_LEN],
    params: KdfParams,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &self.key)
            .field("salt", &hex::encode(self.salt))
            .field("params", &self.params)
            .finish()
    }
}

impl KeyMaterial {
    /// Re-derives the key for an existing stream from its header.
    pub fn from_header(password: &[u8], header: &StreamHeader) -> ExportResult<Self> {
        derive_key_with_salt(password, header.params, header.salt)
    }

    fn cipher(&self) -> ExportResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key.0)
            .map_err(|e| ExportError::EncryptionFailed(e.to_string()))
    }
}

/// Derives key material from a password with a fresh random salt.
///
/// This is the slow path (memory-hard) and runs once per export.
pub fn derive_key(password: &[u8], params: KdfParams) -> ExportResult<KeyMaterial> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    derive_key_with_salt(password, params, salt)
}

/// Derives key material from a password and a known salt.
#[instrument(skip(password, salt))]
pub fn derive_key_with_salt(
    password: &[u8],
    params: KdfParams,
    salt: [u8; SALT_LEN],
) -> ExportResult<KeyMaterial> {
    if password.is_empty() {
        return Err(ExportError::KeyDerivation("password is empty".to_string()));
    }
    let argon_params = Params::new(params.mem_cost_kib, params.time_cost, params.lanes, Some(32))
        .map_err(|e| ExportError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut ikm = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(password, &salt, &mut *ikm)
        .map_err(|e| ExportError::KeyDerivation(e.to_string()))?;

    let hk = Hkdf::<Sha256>::new(Some(&salt), &*ikm);
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|e| ExportError::KeyDerivation(e.to_string()))?;
    let key = EncryptionKey(okm);
    okm.zeroize();

    debug!("derived export key");
    Ok(KeyMaterial { key, salt, params })
}

/// Parsed stream header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    /// Argon2id parameters used for the password key.
    pub params: KdfParams,
    /// Password salt.
    pub salt: [u8; SALT_LEN],
    /// Per-file nonce prefix.
    pub nonce_prefix: [u8; NONCE_PREFIX_LEN],
}

impl StreamHeader {
    fn new(km: &KeyMaterial) -> Self {
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_prefix);
        Self {
            params: km.params,
            salt: km.salt,
            nonce_prefix,
        }
    }

    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(MAGIC);
        out[4] = FORMAT_VERSION;
        out[5..9].copy_from_slice(&self.params.mem_cost_kib.to_le_bytes());
        out[9..13].copy_from_slice(&self.params.time_cost.to_le_bytes());
        out[13..17].copy_from_slice(&self.params.lanes.to_le_bytes());
        out[17..17 + SALT_LEN].copy_from_slice(&self.salt);
        out[17 + SALT_LEN..].copy_from_slice(&self.nonce_prefix);
        out
    }

    /// Parses and validates a header.
    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> ExportResult<Self> {
        if &bytes[0..4] != MAGIC {
            return Err(ExportError::CorruptStream("bad magic".to_string()));
        }
        if bytes[4] != FORMAT_VERSION {
            return Err(ExportError::CorruptStream(format!(
                "unsupported format version {}",
                bytes[4]
            )));
        }
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[17..17 + SALT_LEN]);
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        nonce_prefix.copy_from_slice(&bytes[17 + SALT_LEN..]);
        Ok(Self {
            params: KdfParams {
                mem_cost_kib: u32_at(5),
                time_cost: u32_at(9),
                lanes: u32_at(13),
            },
            salt,
            nonce_prefix,
        })
    }

    /// Reads a header from the start of a stream.
    pub fn read_from<R: Read>(reader: &mut R) -> ExportResult<Self> {
        let mut buf = [0u8; HEADER_LEN];
        reader.read_exact(&mut buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                ExportError::CorruptStream("stream shorter than header".to_string())
            }
            _ => ExportError::Io(e),
        })?;
        Self::from_bytes(&buf)
    }

    fn chunk_nonce(&self, index: u64, last: bool) -> ExportResult<[u8; 12]> {
        let counter = u32::try_from(index)
            .map_err(|_| ExportError::EncryptionFailed("chunk counter overflow".to_string()))?;
        let mut nonce = [0u8; 12];
        nonce[..NONCE_PREFIX_LEN].copy_from_slice(&self.nonce_prefix);
        nonce[NONCE_PREFIX_LEN..11].copy_from_slice(&counter.to_be_bytes());
        nonce[11] = u8::from(last);
        Ok(nonce)
    }
}

/// Counters from one encrypt or decrypt pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Bytes consumed from the reader.
    pub bytes_read: u64,
    /// Bytes handed to the writer.
    pub bytes_written: u64,
    /// Number of chunks processed.
    pub chunk_count: u64,
}

/// `ceil(size / CHUNK_SIZE)`.
pub fn chunk_count_for(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encrypts `reader` into `writer` chunk by chunk.
pub fn encrypt_stream<R: Read, W: Write>(
    km: &KeyMaterial,
    reader: &mut R,
    writer: &mut W,
) -> ExportResult<StreamStats> {
    let cipher = km.cipher()?;
    let header = StreamHeader::new(km);
    let aad = header.to_bytes();
    writer.write_all(&aad)?;

    let mut stats = StreamStats {
        bytes_written: HEADER_LEN as u64,
        ..Default::default()
    };

    let mut current = vec![0u8; CHUNK_SIZE];
    let mut next = vec![0u8; CHUNK_SIZE];
    let mut len = read_full(reader, &mut current)?;
    if len == 0 {
        return Ok(stats);
    }

    let mut index = 0u64;
    loop {
        // A short read means EOF, so only a full chunk needs a look-ahead.
        let next_len = if len == CHUNK_SIZE {
            read_full(reader, &mut next)?
        } else {
            0
        };
        let last = next_len == 0;

        let nonce = header.chunk_nonce(index, last)?;
        let ciphertext = cipher
            .encrypt(
                aes_gcm::Nonce::from_slice(&nonce),
                Payload {
                    msg: &current[..len],
                    aad: &aad,
                },
            )
            .map_err(|e| ExportError::EncryptionFailed(e.to_string()))?;

        writer.write_all(&(ciphertext.len() as u32).to_le_bytes())?;
        writer.write_all(&ciphertext)?;

        stats.bytes_read += len as u64;
        stats.bytes_written += 4 + ciphertext.len() as u64;
        stats.chunk_count += 1;

        if last {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        len = next_len;
        index += 1;
    }

    current.zeroize();
    next.zeroize();
    Ok(stats)
}

fn read_frame<R: Read>(reader: &mut R) -> ExportResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let got = read_full(reader, &mut len_buf)?;
    if got == 0 {
        return Ok(None);
    }
    if got < 4 {
        return Err(ExportError::CorruptStream("truncated chunk length".to_string()));
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if !(TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len) {
        return Err(ExportError::CorruptStream(format!(
            "chunk length {} out of range",
            len
        )));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ExportError::CorruptStream("truncated chunk".to_string()),
        _ => ExportError::Io(e),
    })?;
    Ok(Some(frame))
}

/// Decrypts a stream produced by [`encrypt_stream`].
///
/// Every chunk is authenticated before its plaintext is written. When
/// `expected_chunks` is given (from the manifest) the chunk count must match.
pub fn decrypt_stream<R: Read, W: Write>(
    km: &KeyMaterial,
    reader: &mut R,
    writer: &mut W,
    expected_chunks: Option<u64>,
) -> ExportResult<StreamStats> {
    let header = StreamHeader::read_from(reader)?;
    if header.salt != km.salt || header.params != km.params {
        return Err(ExportError::CorruptStream(
            "stream was not produced with this key material".to_string(),
        ));
    }
    let cipher = km.cipher()?;
    let aad = header.to_bytes();

    let mut stats = StreamStats {
        bytes_read: HEADER_LEN as u64,
        ..Default::default()
    };

    let mut pending = read_frame(reader)?;
    let mut index = 0u64;
    while let Some(frame) = pending {
        let following = read_frame(reader)?;
        let last = following.is_none();

        let nonce = header.chunk_nonce(index, last)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    aes_gcm::Nonce::from_slice(&nonce),
                    Payload {
                        msg: &frame,
                        aad: &aad,
                    },
                )
                .map_err(|_| ExportError::DecryptionAuthFailed { chunk: index })?,
        );
        if !last && plaintext.len() != CHUNK_SIZE {
            return Err(ExportError::CorruptStream(format!(
                "short chunk {} before end of stream",
                index
            )));
        }
        writer.write_all(&plaintext)?;

        stats.bytes_read += 4 + frame.len() as u64;
        stats.bytes_written += plaintext.len() as u64;
        stats.chunk_count += 1;

        pending = following;
        index += 1;
    }

    if let Some(expected) = expected_chunks {
        if expected != stats.chunk_count {
            return Err(ExportError::ChunkCountMismatch {
                expected,
                actual: stats.chunk_count,
            });
        }
    }
    Ok(stats)
}

/// Encrypts an in-memory buffer.
pub fn encrypt_bytes(km: &KeyMaterial, plaintext: &[u8]) -> ExportResult<Vec<u8>> {
    let mut out = Vec::with_capacity(plaintext.len() + HEADER_LEN + 64);
    encrypt_stream(km, &mut io::Cursor::new(plaintext), &mut out)?;
    Ok(out)
}

/// Decrypts an in-memory buffer.
pub fn decrypt_bytes(km: &KeyMaterial, ciphertext: &[u8]) -> ExportResult<Vec<u8>> {
    let mut out = Vec::with_capacity(ciphertext.len());
    decrypt_stream(km, &mut io::Cursor::new(ciphertext), &mut out, None)?;
    Ok(out)
}
