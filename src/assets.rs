//! Asset provider collaborator interface.
//!
//! The download/cache subsystem proper is external to this core; the broker
//! only needs two operations from it: an asynchronous readiness request per
//! submission and a post-run diff. [`LocalAssetStore`] is the shipped
//! directory-backed implementation — it materializes the per-project working
//! directory under the cache path and diffs by snapshotting file count and
//! total byte size around the run.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::warn;

use crate::Result;

/// Per-project readiness observed by the broker while a submission waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetState {
    /// A readiness request is in flight.
    Checking,
    /// Project assets are in place; code may run.
    Ready,
    /// The provider failed; the session never reaches READY.
    Error,
}

/// Outcome of the post-run asset diff, sent to the client as a signal frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffResult {
    /// Nothing changed.
    NoOp,
    /// Working directory grew past the size ceiling.
    Oversize,
    /// Working directory holds too many files.
    TooManyFiles,
    /// Files changed; details are provider-defined JSON.
    Changed(serde_json::Value),
}

/// Asset collaborator seen by the session broker.
///
/// `request_assets` may take arbitrarily long; the broker never blocks on it
/// directly and instead polls its own readiness map. `diff_assets` is invoked
/// exactly once per completed run.
pub trait AssetProvider: Send + Sync + 'static {
    /// Prepare the project described by `descriptor` (a submission's JSON).
    ///
    /// Returns `Ok(true)` once the working directory is usable.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Asset`] when preparation fails outright;
    /// the broker treats an error like `Ok(false)`.
    fn request_assets<'a>(
        &'a self,
        descriptor: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Compare the working directory against its pre-run snapshot.
    fn diff_assets(&self) -> Pin<Box<dyn Future<Output = DiffResult> + Send + '_>>;
}

/// Total-size ceiling for a project working directory: 20 MiB.
pub const MAX_PROJECT_BYTES: u64 = 20 * 1024 * 1024;

/// File-count ceiling for a project working directory.
pub const MAX_PROJECT_FILES: u64 = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DirSnapshot {
    files: u64,
    bytes: u64,
}

/// Directory-backed [`AssetProvider`].
#[derive(Debug)]
pub struct LocalAssetStore {
    asset_root: PathBuf,
    current: Mutex<Option<(PathBuf, DirSnapshot)>>,
}

impl LocalAssetStore {
    /// Create a store rooted at `asset_root` (one subdirectory per project).
    #[must_use]
    pub fn new(asset_root: PathBuf) -> Self {
        Self {
            asset_root,
            current: Mutex::new(None),
        }
    }
}

fn scan_dir(dir: &Path, snap: &mut DirSnapshot) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            scan_dir(&entry.path(), snap);
        } else {
            snap.files += 1;
            snap.bytes += meta.len();
        }
    }
}

fn snapshot(dir: &Path) -> DirSnapshot {
    let mut snap = DirSnapshot::default();
    scan_dir(dir, &mut snap);
    snap
}

impl AssetProvider for LocalAssetStore {
    fn request_assets<'a>(
        &'a self,
        descriptor: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            let Some(pid) = descriptor.get("projectId").and_then(|v| v.as_str()) else {
                return Ok(false);
            };
            let dir = self.asset_root.join(pid);
            if let Err(err) = tokio::fs::create_dir_all(&dir).await {
                warn!(project_id = pid, %err, "failed to create project directory");
                return Ok(false);
            }
            let snap = snapshot(&dir);
            *self.current.lock().await = Some((dir, snap));
            Ok(true)
        })
    }

    fn diff_assets(&self) -> Pin<Box<dyn Future<Output = DiffResult> + Send + '_>> {
        Box::pin(async move {
            let guard = self.current.lock().await;
            let Some((dir, before)) = guard.as_ref() else {
                return DiffResult::NoOp;
            };
            let after = snapshot(dir);
            if after.bytes > MAX_PROJECT_BYTES {
                return DiffResult::Oversize;
            }
            if after.files > MAX_PROJECT_FILES {
                return DiffResult::TooManyFiles;
            }
            if after == *before {
                DiffResult::NoOp
            } else {
                DiffResult::Changed(serde_json::json!({
                    "files_before": before.files,
                    "files_after": after.files,
                    "bytes_before": before.bytes,
                    "bytes_after": after.bytes,
                }))
            }
        })
    }
}
