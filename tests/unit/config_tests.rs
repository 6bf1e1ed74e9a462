//! Unit tests for configuration parsing and the persisted runner state.

use std::path::PathBuf;

use webtty::config::{GlobalConfig, RunnerState};
use webtty::AppError;

/// An empty TOML document yields the documented defaults.
#[test]
fn empty_toml_yields_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("empty config must parse");
    assert_eq!(config.http_port, 8000);
    assert_eq!(config.python_path, None);
    assert_eq!(config.poll_interval_ms, 100);
    assert_eq!(config.settle_ms, 100);
    assert_eq!(config.close_grace_ms, 200);
}

/// Explicit fields override defaults; unspecified fields keep theirs.
#[test]
fn partial_toml_overrides_defaults() {
    let config = GlobalConfig::from_toml_str(
        r#"
        http_port = 9001
        cache_dir = "/tmp/webtty-test"
        python_path = "/usr/bin/python3"
        "#,
    )
    .expect("valid config must parse");

    assert_eq!(config.http_port, 9001);
    assert_eq!(config.cache_dir, PathBuf::from("/tmp/webtty-test"));
    assert_eq!(config.python_path.as_deref(), Some("/usr/bin/python3"));
    assert_eq!(config.poll_interval_ms, 100);
}

/// Malformed TOML is a config error.
#[test]
fn malformed_toml_is_rejected() {
    match GlobalConfig::from_toml_str("http_port = \"not a number\"") {
        Err(AppError::Config(_)) => {}
        other => panic!("expected AppError::Config, got {other:?}"),
    }
}

/// Zero timing constants are rejected at load time.
#[test]
fn zero_intervals_are_rejected() {
    match GlobalConfig::from_toml_str("poll_interval_ms = 0") {
        Err(AppError::Config(msg)) => assert!(msg.contains("poll_interval_ms")),
        other => panic!("expected AppError::Config, got {other:?}"),
    }
    match GlobalConfig::from_toml_str("settle_ms = 0") {
        Err(AppError::Config(msg)) => assert!(msg.contains("settle_ms")),
        other => panic!("expected AppError::Config, got {other:?}"),
    }
}

/// Derived paths hang off the configured cache directory.
#[test]
fn derived_paths_follow_cache_dir() {
    let config = GlobalConfig::from_toml_str("cache_dir = \"/var/lib/webtty\"")
        .expect("valid config must parse");
    assert_eq!(config.asset_dir(), PathBuf::from("/var/lib/webtty/asset"));
    assert_eq!(config.state_path(), PathBuf::from("/var/lib/webtty/state.json"));
}

/// Loading a missing config file is a config error, not a panic.
#[test]
fn missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    match GlobalConfig::load(&dir.path().join("no-such.toml")) {
        Err(AppError::Config(msg)) => assert!(msg.contains("cannot read")),
        other => panic!("expected AppError::Config, got {other:?}"),
    }
}

/// Runner state survives a save/load cycle, creating parents as needed.
#[test]
fn runner_state_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("state.json");

    let state = RunnerState {
        python_path: Some("/opt/python/bin/python3".into()),
    };
    state.save(&path).expect("save must succeed");

    assert_eq!(RunnerState::load(&path), state);
}

/// A missing state file loads as the default; discovery runs again.
#[test]
fn missing_runner_state_loads_default() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = RunnerState::load(&dir.path().join("absent.json"));
    assert_eq!(state, RunnerState::default());
}

/// A corrupt state file is ignored rather than fatal.
#[test]
fn corrupt_runner_state_loads_default() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state.json");
    std::fs::write(&path, "{{{not json").expect("write");

    assert_eq!(RunnerState::load(&path), RunnerState::default());
}
