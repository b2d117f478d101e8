//! Configuration management for Droplink.
//!
//! This module handles loading, saving, and managing Droplink configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/droplink/config.toml` |
//! | macOS | `~/Library/Application Support/Droplink/config.toml` |
//! | Windows | `%APPDATA%\Droplink\config.toml` |
//!
//! A missing file yields the defaults; all durations are plain seconds.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration struct for Droplink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Download-side (sharing) settings
    pub share: ShareConfig,
    /// Upload-side (receiving) settings
    pub receive: ReceiveConfig,
    /// Rate limiting and upload size caps
    pub limits: LimitConfig,
    /// Chunked upload protocol settings
    pub chunked: ChunkedConfig,
}

/// Download server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// First port to try when binding
    pub start_port: u16,
    /// Number of increasing ports probed before giving up
    pub port_attempts: u16,
    /// Whether remote peers need operator confirmation before downloading
    pub require_confirmation: bool,
    /// Session lifetime in seconds; the server tears down afterwards
    pub session_expiration_secs: u64,
    /// Seconds before an unresolved confirmation request is denied
    pub confirmation_timeout_secs: u64,
    /// Maximum confirmed peers kept in the active registry
    pub registry_cap: usize,
    /// Seconds between stale-connection sweeps
    pub sweep_interval_secs: u64,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            start_port: crate::DEFAULT_DOWNLOAD_PORT,
            port_attempts: crate::PORT_PROBE_ATTEMPTS,
            require_confirmation: true,
            session_expiration_secs: crate::DEFAULT_SESSION_EXPIRATION_SECS,
            confirmation_timeout_secs: crate::CONFIRMATION_TIMEOUT_SECS,
            registry_cap: crate::MAX_ACTIVE_CONNECTIONS,
            sweep_interval_secs: crate::SWEEP_INTERVAL_SECS,
        }
    }
}

impl ShareConfig {
    /// Session expiration as a [`Duration`].
    #[must_use]
    pub const fn session_expiration(&self) -> Duration {
        Duration::from_secs(self.session_expiration_secs)
    }

    /// Confirmation timeout as a [`Duration`].
    #[must_use]
    pub const fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Upload server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    /// First port to try when binding
    pub start_port: u16,
    /// Number of increasing ports probed before giving up
    pub port_attempts: u16,
    /// Whether uploaders need operator confirmation.
    ///
    /// Off by default: uploads are normally guarded by rate limiting and
    /// the explicit save/discard workflow alone.
    pub require_confirmation: bool,
    /// Session lifetime in seconds
    pub session_expiration_secs: u64,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            start_port: crate::DEFAULT_UPLOAD_PORT,
            port_attempts: crate::PORT_PROBE_ATTEMPTS,
            require_confirmation: false,
            session_expiration_secs: crate::DEFAULT_SESSION_EXPIRATION_SECS,
        }
    }
}

impl ReceiveConfig {
    /// Session expiration as a [`Duration`].
    #[must_use]
    pub const fn session_expiration(&self) -> Duration {
        Duration::from_secs(self.session_expiration_secs)
    }
}

/// Rate limiting and upload size caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Maximum requests admitted per source within the window
    pub rate_limit: usize,
    /// Trailing rate window in seconds
    pub rate_window_secs: u64,
    /// Total-upload size cap per request in bytes
    pub max_request_bytes: u64,
    /// Per-file upload size cap in bytes
    pub max_file_bytes: u64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            rate_limit: crate::DEFAULT_RATE_LIMIT,
            rate_window_secs: crate::RATE_WINDOW_SECS,
            max_request_bytes: crate::MAX_UPLOAD_TOTAL_BYTES,
            max_file_bytes: crate::MAX_UPLOAD_FILE_BYTES,
        }
    }
}

impl LimitConfig {
    /// Rate window as a [`Duration`].
    #[must_use]
    pub const fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }
}

/// Chunked upload protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkedConfig {
    /// Chunk size in bytes
    pub chunk_size: u64,
    /// Number of parallel upload workers
    pub workers: usize,
    /// Out-of-band shared secret for end-to-end chunk encryption.
    ///
    /// When set on both ends, chunks flagged as encrypted are sealed with a
    /// key derived from this secret.
    pub shared_secret: Option<String>,
}

impl Default for ChunkedConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            workers: crate::DEFAULT_UPLOAD_WORKERS,
            shared_secret: None,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns defaults if no config file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| Error::ConfigError(format!("failed to parse {}: {e}", path.display())))
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be resolved or the
    /// file cannot be written.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()
            .ok_or_else(|| Error::ConfigError("cannot resolve config directory".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::write(&path, contents)?;
        Ok(())
    }

    /// Path to the configuration file, if the platform dirs resolve.
    #[must_use]
    pub fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "droplink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
