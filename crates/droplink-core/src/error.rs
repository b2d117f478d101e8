//! Error types for Droplink.
//!
//! This module provides a unified error type for all Droplink operations,
//! with specific error variants for different failure modes.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for Droplink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Droplink.
#[derive(Error, Debug)]
pub enum Error {
    /// No free port in the probe range (E001)
    #[error("no free port in range {start}..{end}")]
    BindExhausted {
        /// First port tried
        start: u16,
        /// One past the last port tried
        end: u16,
    },

    /// Source has not been confirmed by the operator (E002)
    #[error("source '{0}' is not confirmed")]
    NotConfirmed(String),

    /// Source exceeded the request rate limit (E003)
    #[error("source '{0}' exceeded the request rate limit")]
    RateLimited(String),

    /// Upload exceeds the total-size cap (E004)
    #[error("upload exceeds the {limit} byte cap")]
    UploadTooLarge {
        /// The configured cap in bytes
        limit: u64,
    },

    /// Malformed multipart body (E005)
    #[error("invalid multipart body: {0}")]
    InvalidMultipart(String),

    /// Whole-file hash did not match the declared value (E006)
    #[error("hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch {
        /// Hash declared by the sender
        declared: String,
        /// Hash computed over the received bytes
        computed: String,
    },

    /// Chunked transfer id is unknown (E007)
    #[error("unknown transfer '{0}'")]
    UnknownTransfer(String),

    /// Completion requested before all chunks arrived (E008)
    #[error("transfer incomplete: {received} of {total} chunks received")]
    TransferIncomplete {
        /// Chunks received so far
        received: u64,
        /// Total chunks expected
        total: u64,
    },

    /// Chunk payload failed checksum verification
    #[error("checksum mismatch for chunk {chunk}")]
    ChunkChecksumMismatch {
        /// The chunk index that failed
        chunk: u64,
    },

    /// Chunk encryption or decryption failed
    #[error("chunk encryption error: {0}")]
    Encryption(String),

    /// Invalid caller-supplied input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Staged file id is unknown
    #[error("unknown staged file '{0}'")]
    UnknownStagedFile(String),

    /// Remote server rejected a protocol call
    #[error("server rejected {endpoint}: {status}")]
    ServerRejected {
        /// Endpoint that was called
        endpoint: String,
        /// HTTP status returned
        status: u16,
    },

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::BindExhausted { .. } => Some("E001"),
            Self::NotConfirmed(_) => Some("E002"),
            Self::RateLimited(_) => Some("E003"),
            Self::UploadTooLarge { .. } => Some("E004"),
            Self::InvalidMultipart(_) => Some("E005"),
            Self::HashMismatch { .. } | Self::ChunkChecksumMismatch { .. } => Some("E006"),
            Self::UnknownTransfer(_) => Some("E007"),
            Self::TransferIncomplete { .. } => Some("E008"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (the caller can retry).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_)
                | Self::ChunkChecksumMismatch { .. }
                | Self::TransferIncomplete { .. }
        )
    }
}
