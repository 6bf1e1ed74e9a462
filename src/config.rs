//! Global configuration parsing plus the small persisted runner state file.
//!
//! The TOML config covers everything an operator may tune: the listen port,
//! the cache directory holding per-project working directories, the timing
//! constants of the session state machine, and an optional interpreter
//! override. The resolved interpreter path is additionally cached in a JSON
//! sidecar (`state.json` under the cache directory) so restarts skip the
//! `which`/`where` probe.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{AppError, Result};

fn default_http_port() -> u16 {
    8000
}

fn default_cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("WEBTTY_CACHE") {
        return PathBuf::from(dir);
    }
    std::env::var("HOME").map_or_else(
        |_| PathBuf::from(".webtty-cache"),
        |home| Path::new(&home).join(".webtty").join("cache"),
    )
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_settle_ms() -> u64 {
    100
}

fn default_close_grace_ms() -> u64 {
    200
}

/// Global configuration parsed from `config.toml`.
///
/// Every field has a default so an empty file (or no file at all) yields a
/// working configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct GlobalConfig {
    /// TCP port for the HTTP/WebSocket listener.
    pub http_port: u16,
    /// Cache directory; project working directories live under `asset/`.
    pub cache_dir: PathBuf,
    /// Interpreter override; skips discovery entirely when set.
    pub python_path: Option<String>,
    /// Runner poll-tick interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Settle window for link-connection displacement in milliseconds.
    pub settle_ms: u64,
    /// Grace delay after an explicit client close request in milliseconds.
    pub close_grace_ms: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            cache_dir: default_cache_dir(),
            python_path: None,
            poll_interval_ms: default_poll_interval_ms(),
            settle_ms: default_settle_ms(),
            close_grace_ms: default_close_grace_ms(),
        }
    }
}

impl GlobalConfig {
    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when the TOML is malformed or a timing
    /// constant is zero.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("cannot read config: {err}")))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(AppError::Config("poll_interval_ms must be non-zero".into()));
        }
        if self.settle_ms == 0 {
            return Err(AppError::Config("settle_ms must be non-zero".into()));
        }
        Ok(())
    }

    /// Root of the per-project working directories.
    #[must_use]
    pub fn asset_dir(&self) -> PathBuf {
        self.cache_dir.join("asset")
    }

    /// Path of the persisted runner state sidecar.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.cache_dir.join("state.json")
    }
}

/// Persisted runner state, currently just the resolved interpreter path.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RunnerState {
    /// Interpreter path confirmed working on a previous run.
    #[serde(default)]
    pub python_path: Option<String>,
}

impl RunnerState {
    /// Load persisted state from `path`, returning defaults when the file is
    /// missing or unreadable. A corrupt state file is not fatal; discovery
    /// simply runs again.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
                warn!(path = %path.display(), %err, "runner state file corrupt, ignoring");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Persist state to `path`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] when the directory or file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)
            .map_err(|err| AppError::Io(format!("serialize runner state: {err}")))?;
        fs::write(path, text)?;
        Ok(())
    }
}
