//! Dependency-recovery retry policy.
//!
//! A static mapping from Python import names to installable package names,
//! plus the bounded retry counter. The budget is one install-and-rerun cycle
//! per submission.

use std::sync::OnceLock;

use regex::Regex;

/// Maximum automatic install-and-rerun cycles per run.
pub const MAX_ATTEMPTS: u32 = 1;

/// Import name → pip package name for modules whose names differ.
const MODULE_MAP: &[(&str, &str)] = &[
    ("pgzrun", "pgzero"),
    ("PIL", "Pillow"),
    ("PIL.Image", "Pillow"),
    ("cv2", "opencv-python"),
    ("sklearn", "scikit-learn"),
    ("nx", "networkx"),
    ("plt", "matplotlib"),
    ("sp", "scipy"),
    ("md", "markdown"),
    ("yaml", "pyyaml"),
    ("jieba", "jieba"),
    ("bs4", "beautifulsoup4"),
    ("grpc", "grpcio"),
    ("tensorflow", "tensorflow"),
    ("torch", "torch"),
    ("telegram", "python-telegram-bot"),
    ("telebot", "pyTelegramBotAPI"),
    ("aiogram", "aiogram"),
    ("discord", "discord.py"),
    ("vk_api", "vk-api"),
    ("qrcode", "qrcode[pil]"),
];

/// Retry bookkeeping scoped to one run.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    /// Install-and-rerun cycles performed so far.
    pub attempt: u32,
    /// Budget ceiling.
    pub max_attempts: u32,
}

impl RetryContext {
    /// Fresh context with a zero attempt count.
    #[must_use]
    pub fn new() -> Self {
        Self {
            attempt: 0,
            max_attempts: MAX_ATTEMPTS,
        }
    }

    /// `true` once the retry budget is spent.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Record one completed install-and-rerun cycle.
    pub fn record_attempt(&mut self) {
        self.attempt += 1;
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The installable package name for an import name.
#[must_use]
pub fn package_for(module: &str) -> String {
    MODULE_MAP
        .iter()
        .find(|(import, _)| *import == module)
        .map_or_else(|| module.to_owned(), |(_, package)| (*package).to_owned())
}

fn missing_module_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"ModuleNotFoundError: No module named '([^']+)'").unwrap()
    })
}

/// Extract the missing module name from accumulated stderr, if present.
#[must_use]
pub fn match_missing_module(stderr: &str) -> Option<String> {
    missing_module_regex()
        .captures(stderr)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_owned())
}
