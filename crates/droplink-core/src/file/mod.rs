//! Shared-file snapshots and file name handling for Droplink.
//!
//! This module handles:
//! - Snapshotting the shared file list (one stat pass per session)
//! - MIME lookup and coarse type classification
//! - Sanitizing client-supplied file names
//!
//! The snapshot is taken once when a sharing session starts and is immutable
//! for the session's lifetime; adding files means starting a new session with
//! a fresh snapshot. This keeps per-request handling free of disk stats.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One shared file in a session's snapshot.
///
/// The index is stable for the lifetime of the sharing session and is the
/// key used in download and thumbnail URLs.
#[derive(Debug, Clone)]
pub struct SharedFileEntry {
    /// Position in the session's file list
    pub index: usize,
    /// Absolute path on the host
    pub path: PathBuf,
    /// Bare file name presented to clients
    pub name: String,
    /// Size in bytes at snapshot time
    pub size: u64,
    /// Modification time at snapshot time
    pub modified: Option<SystemTime>,
}

impl SharedFileEntry {
    fn from_path(index: usize, path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(Error::InvalidInput(format!(
                "not a regular file: {}",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();

        Ok(Self {
            index,
            path: path.to_path_buf(),
            name,
            size: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }

    /// MIME type for this entry from the extension table.
    #[must_use]
    pub fn mime_type(&self) -> String {
        mime_for_path(&self.path)
    }

    /// Coarse type classification for this entry.
    #[must_use]
    pub fn kind(&self) -> FileKind {
        FileKind::from_mime(&self.mime_type())
    }
}

/// Snapshot a set of paths into a stable, indexed file list.
///
/// Directories are expanded recursively; each regular file is stat'ed once.
/// Hidden files inside expanded directories are skipped.
///
/// # Errors
///
/// Returns an error if a named path does not exist or is not readable.
pub fn snapshot_files(paths: &[PathBuf]) -> Result<Vec<SharedFileEntry>> {
    let mut entries = Vec::new();

    for path in paths {
        if path.is_file() {
            entries.push(SharedFileEntry::from_path(entries.len(), path)?);
        } else if path.is_dir() {
            for entry in walkdir::WalkDir::new(path)
                .follow_links(true)
                .into_iter()
                .filter_map(std::result::Result::ok)
            {
                let p = entry.path();
                if !p.is_file() {
                    continue;
                }
                if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
                    if name.starts_with('.') {
                        continue;
                    }
                }
                entries.push(SharedFileEntry::from_path(entries.len(), p)?);
            }
        } else {
            return Err(Error::FileNotFound(path.display().to_string()));
        }
    }

    Ok(entries)
}

/// Coarse file type classification used by the web catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Raster or vector image
    Image,
    /// Video container
    Video,
    /// Audio file
    Audio,
    /// Plain or structured text
    Text,
    /// Archive or compressed container
    Archive,
    /// Office-style document
    Document,
    /// Everything else
    Other,
}

impl FileKind {
    /// Classify a MIME type string.
    #[must_use]
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            Self::Image
        } else if mime.starts_with("video/") {
            Self::Video
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else if mime.starts_with("text/") || mime == "application/json" {
            Self::Text
        } else if matches!(
            mime,
            "application/zip"
                | "application/gzip"
                | "application/x-tar"
                | "application/x-7z-compressed"
                | "application/x-bzip2"
                | "application/vnd.rar"
        ) {
            Self::Archive
        } else if mime == "application/pdf"
            || mime.starts_with("application/vnd.openxmlformats-officedocument")
            || mime.starts_with("application/vnd.oasis.opendocument")
            || mime == "application/msword"
        {
            Self::Document
        } else {
            Self::Other
        }
    }
}

/// MIME type for a path from the static extension table.
///
/// Unknown extensions map to `application/octet-stream`.
#[must_use]
pub fn mime_for_path(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string()
}

/// Format a file size for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Reduce a client-supplied file name to a bare base name.
///
/// Strips directory components (both separators), parent references, and
/// Windows drive prefixes. An empty result becomes `"unnamed"`.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .trim()
        .trim_start_matches('.');

    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && *c != ':')
        .collect();

    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1024 * 1024), "1.0 MB");
        assert_eq!(format_size(1024 * 1024 * 1024), "1.0 GB");
    }

    #[test]
    fn test_sanitize_bare_name() {
        assert_eq!(sanitize_file_name("photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_file_name("with space.txt"), "with space.txt");
    }

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("/tmp/evil.sh"), "evil.sh");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\doc.pdf"), "doc.pdf");
    }

    #[test]
    fn test_sanitize_empty_becomes_unnamed() {
        assert_eq!(sanitize_file_name(""), "unnamed");
        assert_eq!(sanitize_file_name("..."), "unnamed");
        assert_eq!(sanitize_file_name("/"), "unnamed");
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(FileKind::from_mime("image/png"), FileKind::Image);
        assert_eq!(FileKind::from_mime("video/mp4"), FileKind::Video);
        assert_eq!(FileKind::from_mime("audio/mpeg"), FileKind::Audio);
        assert_eq!(FileKind::from_mime("text/plain"), FileKind::Text);
        assert_eq!(FileKind::from_mime("application/zip"), FileKind::Archive);
        assert_eq!(FileKind::from_mime("application/pdf"), FileKind::Document);
        assert_eq!(
            FileKind::from_mime("application/octet-stream"),
            FileKind::Other
        );
    }

    #[test]
    fn test_mime_for_path_unknown_extension() {
        assert_eq!(
            mime_for_path(Path::new("mystery.zzz")),
            "application/octet-stream"
        );
        assert_eq!(mime_for_path(Path::new("photo.png")), "image/png");
    }

    #[test]
    fn test_snapshot_stable_indices() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let a = temp_dir.path().join("a.txt");
        let b = temp_dir.path().join("b.bin");
        std::fs::write(&a, b"hello").expect("write a");
        std::fs::write(&b, vec![0u8; 2048]).expect("write b");

        let entries = snapshot_files(&[a.clone(), b.clone()]).expect("snapshot");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 0);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].size, 5);
        assert_eq!(entries[1].index, 1);
        assert_eq!(entries[1].size, 2048);
    }

    #[test]
    fn test_snapshot_missing_file() {
        let result = snapshot_files(&[PathBuf::from("/no/such/file.txt")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_snapshot_expands_directories() {
        let temp_dir = TempDir::new().expect("create temp dir");
        std::fs::create_dir(temp_dir.path().join("sub")).expect("mkdir");
        std::fs::write(temp_dir.path().join("sub/one.txt"), b"1").expect("write");
        std::fs::write(temp_dir.path().join("sub/.hidden"), b"x").expect("write");

        let entries = snapshot_files(&[temp_dir.path().to_path_buf()]).expect("snapshot");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "one.txt");
    }
}
