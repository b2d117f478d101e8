//! # Droplink Core Library
//!
//! `droplink-core` provides the core functionality for Droplink, a tool that
//! exposes a temporary, browser-accessible endpoint on the local network so
//! any other device can download shared files or upload files to the host
//! without a client app.
//!
//! ## Features
//!
//! - **Zero-install access**: any browser on the LAN reaches the share via a
//!   printed or QR-coded URL
//! - **Resumable downloads**: full HTTP `Range` support with partial content
//! - **Human-in-the-loop approval**: remote peers must be confirmed by the
//!   host operator before they can fetch protected resources
//! - **Staged uploads**: received files are held in a temporary location
//!   until the operator explicitly saves or discards them
//! - **Chunked parallel uploads**: resumable, hash-verified, optionally
//!   AES-256-GCM encrypted chunk transfer
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`mod@file`] - Shared-file snapshots, MIME classification, name sanitizing
//! - [`gate`] - Connection confirmation gate and active-peer registry
//! - [`limit`] - Per-source sliding-window rate limiting
//! - [`multipart`] - Binary-safe `multipart/form-data` parsing
//! - [`staging`] - Staged-file lifecycle (save/discard workflow)
//! - [`transfer`] - Chunked/parallel upload client protocol
//! - [`web`] - The download and upload HTTP servers
//!
//! ## Example
//!
//! ```rust,ignore
//! use droplink_core::config::Config;
//! use droplink_core::web::DownloadServer;
//!
//! let server = DownloadServer::start(&["file.txt".into()], &Config::default()).await?;
//! println!("Share URL: {}", server.url());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::unused_async)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod error;
pub mod file;
pub mod gate;
pub mod limit;
pub mod multipart;
pub mod staging;
pub mod transfer;
pub mod web;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port the download server probes from
pub const DEFAULT_DOWNLOAD_PORT: u16 = 52580;

/// Default port the upload server probes from
pub const DEFAULT_UPLOAD_PORT: u16 = 52590;

/// Number of increasing ports tried when binding a server
pub const PORT_PROBE_ATTEMPTS: u16 = 10;

/// Default session expiration in seconds (1 hour)
pub const DEFAULT_SESSION_EXPIRATION_SECS: u64 = 3600;

/// Seconds before an unresolved confirmation request flips to denied
pub const CONFIRMATION_TIMEOUT_SECS: u64 = 60;

/// Maximum requests admitted per source within the rate window
pub const DEFAULT_RATE_LIMIT: usize = 60;

/// Trailing rate-limit window in seconds
pub const RATE_WINDOW_SECS: u64 = 60;

/// Maximum number of confirmed peers kept in the active registry
pub const MAX_ACTIVE_CONNECTIONS: usize = 500;

/// Interval between stale-connection sweeps in seconds (5 minutes)
pub const SWEEP_INTERVAL_SECS: u64 = 300;

/// Total-upload size cap per request (10 GiB)
pub const MAX_UPLOAD_TOTAL_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Per-file upload size cap (5 GiB)
pub const MAX_UPLOAD_FILE_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Default chunk size for chunked uploads (1 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default number of parallel chunk upload workers
pub const DEFAULT_UPLOAD_WORKERS: usize = 2;

/// Files at or above this size get a partial (head + tail + size) hash (1 GiB)
pub const PARTIAL_HASH_THRESHOLD: u64 = 1024 * 1024 * 1024;

/// Bytes sampled from each end of the file for a partial hash (1 MiB)
pub const PARTIAL_HASH_SAMPLE: u64 = 1024 * 1024;
