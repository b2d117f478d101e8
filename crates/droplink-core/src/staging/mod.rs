//! Staged-file lifecycle for received uploads.
//!
//! Uploads never land in the destination directory directly: the upload
//! server writes each received file under the session temp directory and
//! hands it to the [`StagingArea`], where it waits for an explicit operator
//! decision. `save` moves the temp copy to the final directory, `discard`
//! deletes it; nothing auto-resolves. Unresolved files are deleted when the
//! receiving session is torn down via [`StagingArea::dispose`].
//!
//! Newly staged files are published on a broadcast stream the operator
//! layer subscribes to.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Lifecycle state of a staged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagedStatus {
    /// Waiting on an operator decision
    Pending,
    /// A save is in flight
    Saving,
    /// Moved to the final directory
    Saved,
    /// Temp copy deleted on operator request
    Discarded,
    /// The save attempt failed
    Error,
}

/// One received file held in the staging area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedFile {
    /// Stable id for operator calls
    pub id: Uuid,
    /// Sanitized client-supplied name
    pub name: String,
    /// Where the temp copy lives
    pub temp_path: PathBuf,
    /// Where the file ended up, once saved
    pub final_path: Option<PathBuf>,
    /// Size in bytes
    pub size: u64,
    /// When the file was received
    pub received_at: chrono::DateTime<chrono::Utc>,
    /// Current lifecycle state
    pub status: StagedStatus,
}

/// Per-item outcome of a bulk save or discard.
#[derive(Debug, Clone, Serialize)]
pub struct BulkOutcome {
    /// The staged file id
    pub id: Uuid,
    /// File name, for display
    pub name: String,
    /// Whether the operation succeeded
    pub ok: bool,
}

/// Disk-backed staging store for one receiving session.
///
/// Cheap to clone; all clones share the same table.
#[derive(Debug, Clone)]
pub struct StagingArea {
    final_dir: PathBuf,
    inner: Arc<Mutex<HashMap<Uuid, StagedFile>>>,
    events: broadcast::Sender<StagedFile>,
}

impl StagingArea {
    /// Create a staging area that saves into `final_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the final directory cannot be created.
    pub fn new(final_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(final_dir)?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            final_dir: final_dir.to_path_buf(),
            inner: Arc::new(Mutex::new(HashMap::new())),
            events,
        })
    }

    /// Register a freshly received file and publish it to subscribers.
    pub fn stage(&self, name: &str, temp_path: &Path, size: u64) -> StagedFile {
        let staged = StagedFile {
            id: Uuid::new_v4(),
            name: name.to_string(),
            temp_path: temp_path.to_path_buf(),
            final_path: None,
            size,
            received_at: chrono::Utc::now(),
            status: StagedStatus::Pending,
        };

        self.lock().insert(staged.id, staged.clone());
        tracing::info!(name, size, "file staged");
        let _ = self.events.send(staged.clone());
        staged
    }

    /// Move a staged file's temp copy into the final directory.
    ///
    /// Returns `true` on success. On failure the file is left in the
    /// `Error` state with its temp copy intact so the operator can retry.
    pub async fn save(&self, id: Uuid) -> bool {
        let Some((name, temp_path)) = self.begin(id) else {
            return false;
        };
        self.finish(id, StagedStatus::Saving, None);

        let final_path = unique_destination(&self.final_dir, &name);
        match move_file(&temp_path, &final_path).await {
            Ok(()) => {
                self.finish(id, StagedStatus::Saved, Some(final_path));
                true
            }
            Err(e) => {
                tracing::warn!(name, error = %e, "failed to save staged file");
                self.finish(id, StagedStatus::Error, None);
                false
            }
        }
    }

    /// Delete a staged file's temp copy.
    ///
    /// Returns `true` on success.
    pub async fn discard(&self, id: Uuid) -> bool {
        let Some((name, temp_path)) = self.begin(id) else {
            return false;
        };

        match tokio::fs::remove_file(&temp_path).await {
            Ok(()) => {
                self.finish(id, StagedStatus::Discarded, None);
                true
            }
            Err(e) => {
                tracing::warn!(name, error = %e, "failed to discard staged file");
                self.finish(id, StagedStatus::Error, None);
                false
            }
        }
    }

    /// Save every pending file, returning a per-item outcome summary.
    pub async fn save_all(&self) -> Vec<BulkOutcome> {
        let mut outcomes = Vec::new();
        for (id, name) in self.pending_ids() {
            let ok = self.save(id).await;
            outcomes.push(BulkOutcome { id, name, ok });
        }
        outcomes
    }

    /// Discard every pending file, returning a per-item outcome summary.
    pub async fn discard_all(&self) -> Vec<BulkOutcome> {
        let mut outcomes = Vec::new();
        for (id, name) in self.pending_ids() {
            let ok = self.discard(id).await;
            outcomes.push(BulkOutcome { id, name, ok });
        }
        outcomes
    }

    /// Delete every still-pending temp file.
    ///
    /// Called during session teardown; saved and discarded entries are
    /// untouched.
    pub async fn dispose(&self) {
        for (id, _) in self.pending_ids() {
            let temp_path = {
                self.lock().get(&id).map(|f| f.temp_path.clone())
            };
            if let Some(path) = temp_path {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %path.display(), error = %e, "dispose failed");
                    }
                }
            }
        }
        self.lock().clear();
    }

    /// Snapshot of all staged files, newest last.
    #[must_use]
    pub fn list(&self) -> Vec<StagedFile> {
        let mut files: Vec<StagedFile> = self.lock().values().cloned().collect();
        files.sort_by_key(|f| f.received_at);
        files
    }

    /// Look up one staged file.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<StagedFile> {
        self.lock().get(&id).cloned()
    }

    /// Subscribe to newly staged files.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StagedFile> {
        self.events.subscribe()
    }

    /// The directory saved files end up in.
    #[must_use]
    pub fn final_dir(&self) -> &Path {
        &self.final_dir
    }

    /// Check that an entry is still resolvable and return what the I/O needs.
    fn begin(&self, id: Uuid) -> Option<(String, PathBuf)> {
        let inner = self.lock();
        let file = inner.get(&id)?;
        if file.status != StagedStatus::Pending && file.status != StagedStatus::Error {
            return None;
        }
        Some((file.name.clone(), file.temp_path.clone()))
    }

    fn finish(&self, id: Uuid, status: StagedStatus, final_path: Option<PathBuf>) {
        if let Some(file) = self.lock().get_mut(&id) {
            file.status = status;
            file.final_path = final_path;
        }
    }

    fn pending_ids(&self) -> Vec<(Uuid, String)> {
        self.lock()
            .values()
            .filter(|f| f.status == StagedStatus::Pending)
            .map(|f| (f.id, f.name.clone()))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, StagedFile>> {
        self.inner.lock().expect("staging lock poisoned")
    }
}

/// Move `from` to `to`, falling back to copy + remove across filesystems.
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await.map_err(Error::from)
        }
    }
}

/// Pick a destination path in `dir` that does not collide with an existing
/// file, appending ` (n)` before the extension as needed.
fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (name.to_string(), None),
    };

    for n in 1u32.. {
        let next = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(next);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("ran out of collision suffixes")
}
