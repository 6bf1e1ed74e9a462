#![forbid(unsafe_code)]

//! `webtty` — WebSocket terminal bridge server binary.
//!
//! Bootstraps configuration, starts the runner poll loop, and serves the
//! WebSocket endpoint until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use webtty::assets::LocalAssetStore;
use webtty::config::GlobalConfig;
use webtty::install::PipInstaller;
use webtty::runner::{python::PythonLocator, spawn_poll_loop, Runner};
use webtty::session::SessionHub;
use webtty::ws::{self, ServerContext};
use webtty::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "webtty", about = "WebSocket terminal bridge to a local Python interpreter", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("webtty server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(port) = args.port {
        config.http_port = port;
    }
    let config = Arc::new(config);
    info!(port = config.http_port, cache = %config.cache_dir.display(), "configuration loaded");

    // ── Build the session hub and runner ────────────────
    let assets = Arc::new(LocalAssetStore::new(config.asset_dir()));
    let hub = SessionHub::new(
        assets,
        Duration::from_millis(config.settle_ms),
        Duration::from_millis(config.close_grace_ms),
    );

    let locator = PythonLocator::new(config.python_path.clone(), config.state_path());
    let runner = Arc::new(Runner::new(
        Arc::new(hub.clone()),
        locator,
        Arc::new(PipInstaller::new()),
        config.asset_dir(),
    ));

    let ct = CancellationToken::new();
    let poll_handle = spawn_poll_loop(
        Arc::clone(&runner),
        Duration::from_millis(config.poll_interval_ms),
        ct.clone(),
    );

    // ── Serve until interrupted ─────────────────────────
    let ctx = Arc::new(ServerContext::new(hub));
    let server = tokio::spawn(ws::serve(ctx, config.http_port, ct.clone()));

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
    ct.cancel();

    let _ = poll_handle.await;
    match server.await {
        Ok(result) => result,
        Err(err) => Err(AppError::Io(format!("server task panicked: {err}"))),
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
