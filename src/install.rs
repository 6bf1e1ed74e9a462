//! Dependency installer collaborator interface.
//!
//! The runner's bounded retry loop hands a package name to the installer and
//! forwards its progress lines to the client as output frames. Only one
//! install is in flight system-wide at any time; the runner guarantees that
//! by awaiting the install before anything else proceeds.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{AppError, Result};

/// Package installer seen by the process runner.
pub trait DependencyInstaller: Send + Sync + 'static {
    /// Install `package` using `interpreter`, streaming human-readable
    /// progress lines through `progress`.
    ///
    /// Returns `Ok(true)` when the install succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Install`] when the install command itself cannot
    /// be started.
    fn install<'a>(
        &'a self,
        interpreter: &'a str,
        package: &'a str,
        progress: mpsc::Sender<String>,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;
}

/// Substrings that qualify a pip output line as progress worth forwarding.
const PROGRESS_MARKERS: &[&str] = &[
    "Collecting",
    "Downloading",
    "Installing",
    "Successfully",
    "%",
];

/// `pip`-backed [`DependencyInstaller`] running through the session's
/// interpreter (`python -m pip install …`).
#[derive(Debug, Default)]
pub struct PipInstaller;

impl PipInstaller {
    /// Create the installer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

async fn forward_progress<R>(stream: R, progress: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if PROGRESS_MARKERS.iter().any(|m| trimmed.contains(m)) {
            if progress.send(trimmed.to_owned()).await.is_err() {
                break;
            }
        }
    }
}

impl DependencyInstaller for PipInstaller {
    fn install<'a>(
        &'a self,
        interpreter: &'a str,
        package: &'a str,
        progress: mpsc::Sender<String>,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            info!(package, "starting dependency install");

            let mut child = Command::new(interpreter)
                .args([
                    "-m",
                    "pip",
                    "install",
                    package,
                    "--no-cache-dir",
                    "--no-warn-script-location",
                ])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| AppError::Install(format!("failed to start pip: {err}")))?;

            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| AppError::Install("failed to capture pip stdout".into()))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| AppError::Install("failed to capture pip stderr".into()))?;

            let out_task = tokio::spawn(forward_progress(stdout, progress.clone()));
            let err_task = tokio::spawn(forward_progress(stderr, progress));

            let status = child
                .wait()
                .await
                .map_err(|err| AppError::Install(format!("pip wait failed: {err}")))?;

            let _ = out_task.await;
            let _ = err_task.await;

            if !status.success() {
                warn!(package, code = ?status.code(), "pip install failed");
            }
            Ok(status.success())
        })
    }
}
