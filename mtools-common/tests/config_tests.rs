//! Integration tests for configuration loading and graceful degradation
//!
//! Tests that manipulate MTOOLS_CONFIG are marked #[serial] so they do not
//! race each other.

use mtools_common::config::{write_toml_config, TomlConfig, CONFIG_ENV_VAR};
use mtools_common::Error;
use serial_test::serial;
use std::env;
use tempfile::TempDir;

#[test]
#[serial]
fn test_missing_file_falls_back_to_defaults() {
    env::remove_var(CONFIG_ENV_VAR);
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope.toml");

    let (config, source) = TomlConfig::load(Some(&missing)).unwrap();
    assert!(source.is_none());
    assert_eq!(config, TomlConfig::default());
}

#[test]
#[serial]
fn test_cli_path_beats_env_var() {
    let temp_dir = TempDir::new().unwrap();
    let cli_path = temp_dir.path().join("cli.toml");
    let env_path = temp_dir.path().join("env.toml");

    let mut cli_config = TomlConfig::default();
    cli_config.server.port = 9100;
    write_toml_config(&cli_config, &cli_path).unwrap();

    let mut env_config = TomlConfig::default();
    env_config.server.port = 9200;
    write_toml_config(&env_config, &env_path).unwrap();

    env::set_var(CONFIG_ENV_VAR, &env_path);

    let (config, source) = TomlConfig::load(Some(&cli_path)).unwrap();
    assert_eq!(config.server.port, 9100);
    assert_eq!(source.as_deref(), Some(cli_path.as_path()));

    let (config, source) = TomlConfig::load(None).unwrap();
    assert_eq!(config.server.port, 9200);
    assert_eq!(source.as_deref(), Some(env_path.as_path()));

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_malformed_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bad.toml");
    std::fs::write(&path, "[limits\nmax_upload_mb = ").unwrap();

    let result = TomlConfig::load(Some(&path));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_round_trip_preserves_storage_layout() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");

    let mut config = TomlConfig::default();
    config.storage.upload_dir = temp_dir.path().join("u");
    config.storage.output_dir = temp_dir.path().join("o");
    config.storage.temp_dir = temp_dir.path().join("t");
    config.retention.temp_retention_hours = Some(6);
    write_toml_config(&config, &path).unwrap();

    let loaded = TomlConfig::from_file(&path).unwrap();
    assert_eq!(loaded, config);
    assert!(loaded.validate().is_ok());
}
