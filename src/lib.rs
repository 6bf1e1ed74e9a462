#![forbid(unsafe_code)]

//! Single-tenant WebSocket terminal bridge to a locally spawned Python
//! interpreter: one remote client, one session, exactly-once execution per
//! submission, with a bounded dependency-recovery retry around each run.

pub mod assets;
pub mod config;
pub mod errors;
pub mod frame;
pub mod install;
pub mod runner;
pub mod session;
pub mod ws;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
