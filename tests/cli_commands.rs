//! CLI Command Tests
//!
//! Commands run in-process through `run_command`.

use std::io::Write;

use shard_recovery::cli::{run_command, CliErrorCode, Command};

// =============================================================================
// check-config
// =============================================================================

#[test]
fn test_check_config_accepts_valid_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"max_push_bytes": 65536, "log_rounds": true}}"#).unwrap();

    let result = run_command(Command::CheckConfig {
        config: file.path().to_path_buf(),
    });
    assert!(result.is_ok());
}

#[test]
fn test_check_config_rejects_zero_budget() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"max_push_bytes": 0}}"#).unwrap();

    let err = run_command(Command::CheckConfig {
        config: file.path().to_path_buf(),
    })
    .unwrap_err();
    assert_eq!(err.code(), &CliErrorCode::ConfigError);
}

#[test]
fn test_check_config_missing_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let err = run_command(Command::CheckConfig {
        config: dir.path().join("absent.json"),
    })
    .unwrap_err();
    assert_eq!(err.code(), &CliErrorCode::ConfigError);
}

// =============================================================================
// simulate
// =============================================================================

#[test]
fn test_simulate_small_replica_set_succeeds() {
    let result = run_command(Command::Simulate {
        config: None,
        replicas: 3,
        objects: 2,
        object_size: 20_000,
        omap_keys: 5,
        max_push_bytes: Some(4096),
        seed: Some(42),
        verbose: false,
    });
    assert!(result.is_ok(), "{:?}", result.err());
}

#[test]
fn test_simulate_rejects_single_replica() {
    let err = run_command(Command::Simulate {
        config: None,
        replicas: 1,
        objects: 1,
        object_size: 10,
        omap_keys: 0,
        max_push_bytes: None,
        seed: None,
        verbose: false,
    })
    .unwrap_err();
    assert_eq!(err.code(), &CliErrorCode::InvalidArgument);
}
