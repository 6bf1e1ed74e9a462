//! Interpreter discovery.
//!
//! Resolution order: explicit config override, the persisted path from a
//! previous run (revalidated against the filesystem), then a `which`/`where`
//! probe over the platform candidates. The result is cached in memory for
//! the lifetime of the process and persisted for the next one.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::RunnerState;
use crate::Result;

#[cfg(windows)]
const PYTHON_CANDIDATES: &[&str] = &["python", "py", "python3"];
#[cfg(not(windows))]
const PYTHON_CANDIDATES: &[&str] = &["python3", "python"];

#[cfg(windows)]
const LOOKUP_CMD: &str = "where";
#[cfg(not(windows))]
const LOOKUP_CMD: &str = "which";

/// Last-resort interpreter name when no probe succeeds.
const FALLBACK: &str = "python";

/// Resolves and caches the interpreter executable path.
#[derive(Debug)]
pub struct PythonLocator {
    override_path: Option<String>,
    state_path: PathBuf,
    cached: Mutex<Option<String>>,
}

impl PythonLocator {
    /// Create a locator. `override_path` short-circuits discovery entirely;
    /// `state_path` is the JSON sidecar holding the persisted result.
    #[must_use]
    pub fn new(override_path: Option<String>, state_path: PathBuf) -> Self {
        Self {
            override_path,
            state_path,
            cached: Mutex::new(None),
        }
    }

    /// The interpreter path, resolved once and cached afterwards.
    ///
    /// # Errors
    ///
    /// Currently infallible (discovery falls back to a bare `python`), but
    /// kept fallible for callers; a future override validation may fail.
    pub async fn resolve(&self) -> Result<String> {
        {
            let cached = self.cached.lock().await;
            if let Some(path) = cached.as_ref() {
                return Ok(path.clone());
            }
        }

        let path = self.discover().await;
        info!(path, "interpreter resolved");
        *self.cached.lock().await = Some(path.clone());
        Ok(path)
    }

    async fn discover(&self) -> String {
        if let Some(path) = &self.override_path {
            return path.clone();
        }

        let state = RunnerState::load(&self.state_path);
        if let Some(saved) = state.python_path {
            if Path::new(&saved).exists() {
                info!(path = saved, "using persisted interpreter path");
                return saved;
            }
        }

        for candidate in PYTHON_CANDIDATES {
            if let Some(found) = probe(candidate).await {
                let state = RunnerState {
                    python_path: Some(found.clone()),
                };
                if let Err(err) = state.save(&self.state_path) {
                    warn!(%err, "failed to persist interpreter path");
                }
                return found;
            }
        }

        FALLBACK.to_owned()
    }
}

/// Probe one candidate via `which`/`where`, returning the first hit.
async fn probe(candidate: &str) -> Option<String> {
    let output = Command::new(LOOKUP_CMD)
        .arg(candidate)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(ToOwned::to_owned)
}
