//! Tests for configuration resolution and persistence
//!
//! Covers:
//! - Missing config file → warning + compiled defaults
//! - Malformed config file → Config error
//! - Priority order: CLI path > CAPSULE_CONFIG > platform default
//! - Environment overrides for base URL and tokens
//! - Atomic write with owner-only permissions
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Tests that manipulate CAPSULE_* variables are marked with #[serial].

use capsule_common::config::{
    load_toml_config, write_toml_config, ConfigResolver, TomlConfig, ENV_ACCESS_TOKEN,
    ENV_API_BASE_URL, ENV_CONFIG_PATH, ENV_REFRESH_TOKEN,
};
use capsule_common::Error;
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

fn clear_env() {
    env::remove_var(ENV_CONFIG_PATH);
    env::remove_var(ENV_API_BASE_URL);
    env::remove_var(ENV_ACCESS_TOKEN);
    env::remove_var(ENV_REFRESH_TOKEN);
}

#[test]
#[serial]
fn test_missing_file_falls_back_to_defaults() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope.toml");

    let config = ConfigResolver::new()
        .with_cli_path(Some(missing))
        .resolve()
        .expect("missing file must not be an error");

    assert_eq!(config, TomlConfig::default());
}

#[test]
#[serial]
fn test_malformed_file_is_config_error() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    fs::write(&path, "api_base_url = [not toml").unwrap();

    let result = ConfigResolver::new().with_cli_path(Some(path)).resolve();
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
#[serial]
fn test_cli_path_beats_env_path() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();

    let cli_path = temp_dir.path().join("cli.toml");
    fs::write(&cli_path, "api_base_url = \"http://cli:1\"\n").unwrap();
    let env_path = temp_dir.path().join("env.toml");
    fs::write(&env_path, "api_base_url = \"http://env:2\"\n").unwrap();

    env::set_var(ENV_CONFIG_PATH, &env_path);

    let from_cli = ConfigResolver::new()
        .with_cli_path(Some(cli_path))
        .resolve()
        .unwrap();
    assert_eq!(from_cli.api_base_url, "http://cli:1");

    let from_env = ConfigResolver::new().resolve().unwrap();
    assert_eq!(from_env.api_base_url, "http://env:2");

    clear_env();
}

#[test]
#[serial]
fn test_env_overrides_file_values() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
api_base_url = "http://file:5002"

[auth]
access_token = "file-access"
refresh_token = "file-refresh"
"#,
    )
    .unwrap();

    env::set_var(ENV_API_BASE_URL, "http://env:5002");
    env::set_var(ENV_ACCESS_TOKEN, "env-access");

    let config = ConfigResolver::new()
        .with_cli_path(Some(path))
        .resolve()
        .unwrap();

    assert_eq!(config.api_base_url, "http://env:5002");
    assert_eq!(config.auth.access_token.as_deref(), Some("env-access"));
    // Not overridden
    assert_eq!(config.auth.refresh_token.as_deref(), Some("file-refresh"));

    clear_env();
}

#[test]
#[serial]
fn test_blank_env_values_are_ignored() {
    clear_env();
    env::set_var(ENV_API_BASE_URL, "   ");

    let mut config = TomlConfig::default();
    config.apply_env_overrides();
    assert_eq!(config.api_base_url, "http://localhost:5002");

    clear_env();
}

#[test]
fn test_write_then_load_preserves_tokens() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("config.toml");

    let mut config = TomlConfig::default();
    config.auth.access_token = Some("abc".to_string());
    config.auth.refresh_token = Some("def".to_string());
    config.polling.upload_interval_ms = 900;

    write_toml_config(&config, &path).unwrap();
    assert!(path.exists());
    assert!(!temp_dir.path().join("nested").join("config.toml.tmp").exists());

    let loaded = load_toml_config(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_write_omits_absent_tokens() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");

    write_toml_config(&TomlConfig::default(), &path).unwrap();
    let content = fs::read_to_string(&path).unwrap();

    assert!(!content.contains("access_token"));
    assert!(content.contains("api_base_url"));
}

#[cfg(unix)]
#[test]
fn test_write_sets_permissions_0600() {
    use std::os::unix::fs::PermissionsExt;

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    write_toml_config(&TomlConfig::default(), &path).unwrap();

    let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
}
