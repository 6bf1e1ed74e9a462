//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Wire frame is empty or carries an unrecognized tag.
    Frame(String),
    /// Session state or connection arbitration failure.
    Session(String),
    /// Asset provider reported the project unavailable or broken.
    Asset(String),
    /// Interpreter process could not be spawned.
    Spawn(String),
    /// Interpreter process exited abnormally.
    Runtime(String),
    /// Dependency installation failed after the retry budget was spent.
    Install(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Frame(msg) => write!(f, "frame: {msg}"),
            Self::Session(msg) => write!(f, "session: {msg}"),
            Self::Asset(msg) => write!(f, "asset: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Runtime(msg) => write!(f, "runtime: {msg}"),
            Self::Install(msg) => write!(f, "install: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
