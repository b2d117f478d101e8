//! Chunked/parallel upload protocol.
//!
//! The upload server's chunk endpoints speak a small protocol: an initiate
//! call declaring file metadata and chunk count, one raw-body request per
//! chunk, and a completion call carrying a whole-file hash for server-side
//! verification. This module holds the protocol types shared by both ends
//! and [`ChunkedUploadClient`], the driver that uploads a file through N
//! parallel workers pulling chunks from a shared queue.
//!
//! ## Integrity
//!
//! Every chunk carries an xxHash64 checksum of its plaintext. The whole
//! file is fingerprinted before transfer: files under 1 GiB get a streaming
//! SHA-256; larger files get a cheaper partial hash over the first and last
//! 1 MiB plus the file size. The two forms are tagged distinctly
//! (`sha256:` / `partial:`) so the server always knows which it verifies.
//!
//! ## Encryption
//!
//! Chunks may optionally be sealed with AES-256-GCM, with a random 12-byte
//! nonce prefixed to the ciphertext+tag. The key is either generated
//! locally and handed to the receiver out of band, or derived on both ends
//! from a shared secret.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Nonce length prefixed to every encrypted chunk.
pub const NONCE_LEN: usize = 12;

/// Header carrying the transfer id on chunk requests.
pub const HEADER_TRANSFER_ID: &str = "x-transfer-id";
/// Header carrying the chunk index on chunk requests.
pub const HEADER_CHUNK_INDEX: &str = "x-chunk-index";
/// Header carrying the original (plaintext) chunk size.
pub const HEADER_CHUNK_SIZE: &str = "x-chunk-size";
/// Header carrying the xxHash64 checksum of the plaintext chunk.
pub const HEADER_CHUNK_CHECKSUM: &str = "x-chunk-checksum";
/// Header flagging an encrypted chunk body (`1` or `0`).
pub const HEADER_CHUNK_ENCRYPTED: &str = "x-chunk-encrypted";

/// One chunk's place in the source file.
///
/// Immutable once computed from the committed chunk size and total size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Chunk index, zero-based
    pub index: u64,
    /// Byte offset within the file
    pub offset: u64,
    /// Chunk length in bytes
    pub len: u64,
}

/// Compute the chunk layout for a file.
#[must_use]
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> Vec<ChunkDescriptor> {
    if chunk_size == 0 || file_size == 0 {
        return Vec::new();
    }

    let count = file_size.div_ceil(chunk_size);
    (0..count)
        .map(|index| {
            let offset = index * chunk_size;
            ChunkDescriptor {
                index,
                offset,
                len: chunk_size.min(file_size - offset),
            }
        })
        .collect()
}

// ============================================================================
// Whole-file hashing
// ============================================================================

/// Which fingerprint form a hash string carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    /// Full streaming SHA-256 of the file contents
    Sha256,
    /// SHA-256 over the first and last 1 MiB plus the file size
    Partial,
}

/// A tagged whole-file fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHash {
    /// Fingerprint form
    pub kind: HashKind,
    /// Lowercase hex digest
    pub hex: String,
}

impl std::fmt::Display for FileHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            HashKind::Sha256 => write!(f, "sha256:{}", self.hex),
            HashKind::Partial => write!(f, "partial:{}", self.hex),
        }
    }
}

impl std::str::FromStr for FileHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(hex) = s.strip_prefix("sha256:") {
            Ok(Self {
                kind: HashKind::Sha256,
                hex: hex.to_string(),
            })
        } else if let Some(hex) = s.strip_prefix("partial:") {
            Ok(Self {
                kind: HashKind::Partial,
                hex: hex.to_string(),
            })
        } else {
            Err(Error::InvalidInput(format!("untagged hash '{s}'")))
        }
    }
}

/// Fingerprint a file, choosing the form by size.
///
/// Files under [`crate::PARTIAL_HASH_THRESHOLD`] get a full SHA-256;
/// larger files get the partial form.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn hash_file(path: &Path) -> Result<FileHash> {
    let size = tokio::fs::metadata(path).await?.len();
    let kind = if size >= crate::PARTIAL_HASH_THRESHOLD {
        HashKind::Partial
    } else {
        HashKind::Sha256
    };
    hash_file_as(path, kind).await
}

/// Fingerprint a file with a specific form.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn hash_file_as(path: &Path, kind: HashKind) -> Result<FileHash> {
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    let mut hasher = Sha256::new();

    match kind {
        HashKind::Sha256 => {
            let mut buffer = vec![0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
        }
        HashKind::Partial => {
            let sample = crate::PARTIAL_HASH_SAMPLE.min(size);
            let mut head = vec![0u8; usize::try_from(sample).unwrap_or(usize::MAX)];
            file.read_exact(&mut head).await?;
            hasher.update(&head);

            file.seek(std::io::SeekFrom::Start(size - sample)).await?;
            let mut tail = vec![0u8; head.len()];
            file.read_exact(&mut tail).await?;
            hasher.update(&tail);

            hasher.update(size.to_le_bytes());
        }
    }

    Ok(FileHash {
        kind,
        hex: hex_encode(&hasher.finalize()),
    })
}

/// Verify a file against a declared, tagged hash string.
///
/// # Errors
///
/// Returns [`Error::HashMismatch`] when the computed hash differs, or an
/// I/O error if the file cannot be read.
pub async fn verify_declared_hash(path: &Path, declared: &str) -> Result<()> {
    let declared: FileHash = declared.parse()?;
    let computed = hash_file_as(path, declared.kind).await?;
    if computed == declared {
        Ok(())
    } else {
        Err(Error::HashMismatch {
            declared: declared.to_string(),
            computed: computed.to_string(),
        })
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
        s
    })
}

// ============================================================================
// Chunk encryption
// ============================================================================

/// AES-256-GCM sealer/opener for chunk payloads.
pub struct ChunkCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCipher").finish_non_exhaustive()
    }
}

impl ChunkCipher {
    /// Generate a fresh random key and the cipher for it.
    ///
    /// The key must reach the receiver out of band (e.g. inside a QR code).
    #[must_use]
    pub fn generate() -> (Self, [u8; 32]) {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        (Self::from_key(&key), key)
    }

    /// Build a cipher from a raw 32-byte key.
    #[must_use]
    pub fn from_key(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new_from_slice(key).expect("32-byte key is always valid"),
        }
    }

    /// Derive the key from an out-of-band shared secret.
    ///
    /// Both ends derive the same key, so only the secret needs to travel.
    #[must_use]
    pub fn from_secret(secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"droplink:chunk-key:");
        hasher.update(secret.as_bytes());
        let key: [u8; 32] = hasher.finalize().into();
        Self::from_key(&key)
    }

    /// Seal a plaintext chunk: random 12-byte nonce prefixed to
    /// ciphertext+tag.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        use rand::RngCore;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| Error::Encryption(format!("seal failed: {e}")))?;

        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&ciphertext);
        Ok(framed)
    }

    /// Open a sealed chunk produced by [`seal`](Self::seal).
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too short or authentication fails.
    pub fn open(&self, framed: &[u8]) -> Result<Vec<u8>> {
        if framed.len() < NONCE_LEN {
            return Err(Error::Encryption("frame shorter than nonce".into()));
        }
        let (nonce, ciphertext) = framed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Encryption(format!("open failed: {e}")))
    }
}

/// Encode a chunk key for out-of-band distribution (QR code, clipboard).
#[must_use]
pub fn encode_key(key: &[u8; 32]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key)
}

/// Decode a chunk key produced by [`encode_key`].
///
/// # Errors
///
/// Returns an error if the input is not a valid encoding of 32 bytes.
pub fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| Error::InvalidInput(format!("malformed key: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::InvalidInput("key must decode to 32 bytes".into()))
}

/// How the upload client obtains its chunk key.
#[derive(Debug, Clone)]
pub enum UploadEncryption {
    /// Use an explicit 32-byte key distributed out of band
    Key([u8; 32]),
    /// Derive the key from a shared secret known to both ends
    SharedSecret(String),
}

impl UploadEncryption {
    fn cipher(&self) -> ChunkCipher {
        match self {
            Self::Key(key) => ChunkCipher::from_key(key),
            Self::SharedSecret(secret) => ChunkCipher::from_secret(secret),
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// Body of `POST /transfer/parallel/initiate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateRequest {
    /// Client-supplied file name (sanitized server-side)
    pub file_name: String,
    /// Total file size in bytes
    pub file_size: u64,
    /// Committed chunk size in bytes
    pub chunk_size: u64,
    /// Total number of chunks that will be sent
    pub total_chunks: u64,
    /// Whether chunk bodies are AES-256-GCM sealed
    pub encrypted: bool,
}

/// Response of `POST /transfer/parallel/initiate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateResponse {
    /// Id to tag every chunk request with
    pub transfer_id: Uuid,
}

/// Body of `POST /transfer/parallel/complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    /// The transfer being completed
    pub transfer_id: Uuid,
    /// Tagged whole-file hash (`sha256:…` or `partial:…`)
    pub hash: String,
}

/// Response of `POST /transfer/parallel/complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResponse {
    /// Final (sanitized) file name
    pub name: String,
    /// Assembled file size in bytes
    pub size: u64,
}

// ============================================================================
// Upload client
// ============================================================================

/// Configuration for [`ChunkedUploadClient`].
#[derive(Debug, Clone)]
pub struct ChunkedUploadConfig {
    /// Chunk size in bytes
    pub chunk_size: u64,
    /// Number of parallel upload workers
    pub workers: usize,
    /// Optional end-to-end chunk encryption
    pub encryption: Option<UploadEncryption>,
}

impl Default for ChunkedUploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            workers: crate::DEFAULT_UPLOAD_WORKERS,
            encryption: None,
        }
    }
}

/// Summary of a finished chunked upload.
#[derive(Debug, Clone)]
pub struct UploadReport {
    /// Uploaded file name
    pub file_name: String,
    /// Bytes uploaded (plaintext size)
    pub bytes: u64,
    /// Number of chunks sent
    pub chunks: u64,
    /// The tagged hash the server verified
    pub hash: String,
}

/// Chunk-parallel upload driver against an upload server.
#[derive(Debug)]
pub struct ChunkedUploadClient {
    http: reqwest::Client,
    base_url: String,
    config: ChunkedUploadConfig,
}

impl ChunkedUploadClient {
    /// Create a client for the server at `base_url` (no trailing slash).
    #[must_use]
    pub fn new(base_url: impl Into<String>, config: ChunkedUploadConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            config,
        }
    }

    /// Upload one file through the chunked protocol.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, a request fails, or the
    /// server rejects any call.
    pub async fn upload(&self, path: &Path) -> Result<UploadReport> {
        let metadata = tokio::fs::metadata(path).await?;
        let file_size = metadata.len();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();

        let chunks = plan_chunks(file_size, self.config.chunk_size);
        let hash = hash_file(path).await?;
        let cipher = self.config.encryption.as_ref().map(|mode| Arc::new(mode.cipher()));

        let initiate = InitiateRequest {
            file_name: file_name.clone(),
            file_size,
            chunk_size: self.config.chunk_size,
            total_chunks: chunks.len() as u64,
            encrypted: cipher.is_some(),
        };

        let response = self
            .http
            .post(format!("{}/transfer/parallel/initiate", self.base_url))
            .json(&initiate)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::ServerRejected {
                endpoint: "/transfer/parallel/initiate".into(),
                status: response.status().as_u16(),
            });
        }
        let InitiateResponse { transfer_id } = response.json().await?;

        tracing::info!(
            file = file_name,
            size = file_size,
            chunks = chunks.len(),
            workers = self.config.workers,
            "chunked upload started"
        );

        let total_chunks = chunks.len() as u64;
        let queue = Arc::new(Mutex::new(VecDeque::from(chunks)));
        let mut workers = tokio::task::JoinSet::new();

        for _ in 0..self.config.workers.max(1) {
            workers.spawn(chunk_worker(
                self.http.clone(),
                format!("{}/transfer/chunk", self.base_url),
                transfer_id,
                path.to_path_buf(),
                Arc::clone(&queue),
                cipher.clone(),
            ));
        }

        while let Some(result) = workers.join_next().await {
            result.map_err(|e| Error::Internal(format!("upload worker panicked: {e}")))??;
        }

        let complete = CompleteRequest {
            transfer_id,
            hash: hash.to_string(),
        };
        let response = self
            .http
            .post(format!("{}/transfer/parallel/complete", self.base_url))
            .json(&complete)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::ServerRejected {
                endpoint: "/transfer/parallel/complete".into(),
                status: response.status().as_u16(),
            });
        }

        Ok(UploadReport {
            file_name,
            bytes: file_size,
            chunks: total_chunks,
            hash: hash.to_string(),
        })
    }
}

/// One upload worker: pull chunk descriptors off the shared queue until it
/// runs dry, sending each as its own request.
async fn chunk_worker(
    http: reqwest::Client,
    url: String,
    transfer_id: Uuid,
    path: PathBuf,
    queue: Arc<Mutex<VecDeque<ChunkDescriptor>>>,
    cipher: Option<Arc<ChunkCipher>>,
) -> Result<()> {
    loop {
        let descriptor = {
            let mut queue = queue.lock().expect("chunk queue lock poisoned");
            queue.pop_front()
        };
        let Some(descriptor) = descriptor else {
            return Ok(());
        };

        let plaintext = read_chunk(&path, descriptor).await?;
        let checksum = xxhash_rust::xxh64::xxh64(&plaintext, 0);

        let (body, encrypted) = match &cipher {
            Some(cipher) => (cipher.seal(&plaintext)?, true),
            None => (plaintext, false),
        };

        let response = http
            .post(&url)
            .header(HEADER_TRANSFER_ID, transfer_id.to_string())
            .header(HEADER_CHUNK_INDEX, descriptor.index.to_string())
            .header(HEADER_CHUNK_SIZE, descriptor.len.to_string())
            .header(HEADER_CHUNK_CHECKSUM, checksum.to_string())
            .header(HEADER_CHUNK_ENCRYPTED, if encrypted { "1" } else { "0" })
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::ServerRejected {
                endpoint: "/transfer/chunk".into(),
                status: response.status().as_u16(),
            });
        }
    }
}

/// Read one chunk's bytes at its offset.
async fn read_chunk(path: &Path, descriptor: ChunkDescriptor) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(descriptor.offset)).await?;

    let mut buffer = vec![0u8; usize::try_from(descriptor.len).unwrap_or(usize::MAX)];
    file.read_exact(&mut buffer).await?;
    Ok(buffer)
}
