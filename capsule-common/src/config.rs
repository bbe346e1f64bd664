//! Configuration loading and resolution
//!
//! Settings are resolved in this priority order:
//! 1. Command-line argument (highest priority, applied by the binary)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing config file is never fatal: a warning is logged and compiled
//! defaults are used. A config file that exists but does not parse is a
//! configuration error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const ENV_CONFIG_PATH: &str = "CAPSULE_CONFIG";
/// Environment variable overriding `api_base_url`
pub const ENV_API_BASE_URL: &str = "CAPSULE_API_BASE_URL";
/// Environment variable overriding `auth.access_token`
pub const ENV_ACCESS_TOKEN: &str = "CAPSULE_ACCESS_TOKEN";
/// Environment variable overriding `auth.refresh_token`
pub const ENV_REFRESH_TOKEN: &str = "CAPSULE_REFRESH_TOKEN";

const CONFIG_DIR_NAME: &str = "capsule-sync";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Client configuration loaded from TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Base URL of the remote capsule service (without the `/api` suffix)
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Per-request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Download previews during lightweight and boot syncs
    #[serde(default = "default_true")]
    pub include_previews: bool,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub boot: BootConfig,

    #[serde(default)]
    pub auto_sync: AutoSyncConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Poll loop intervals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_download_interval_ms")]
    pub download_interval_ms: u64,

    #[serde(default = "default_upload_interval_ms")]
    pub upload_interval_ms: u64,
}

/// Boot-time reconciliation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootConfig {
    /// Seconds before the user may skip the boot sync
    #[serde(default = "default_skip_after_secs")]
    pub skip_after_secs: u64,
}

/// Debounced auto-sync after local data changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoSyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_auto_sync_delay_secs")]
    pub delay_secs: u64,
}

/// Stored credentials
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

fn default_api_base_url() -> String {
    "http://localhost:5002".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_download_interval_ms() -> u64 {
    1000
}

fn default_upload_interval_ms() -> u64 {
    1500
}

fn default_skip_after_secs() -> u64 {
    30
}

fn default_auto_sync_delay_secs() -> u64 {
    30
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            include_previews: true,
            logging: LoggingConfig::default(),
            polling: PollingConfig::default(),
            boot: BootConfig::default(),
            auto_sync: AutoSyncConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            download_interval_ms: default_download_interval_ms(),
            upload_interval_ms: default_upload_interval_ms(),
        }
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            skip_after_secs: default_skip_after_secs(),
        }
    }
}

impl Default for AutoSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_secs: default_auto_sync_delay_secs(),
        }
    }
}

impl TomlConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn download_poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.download_interval_ms.max(1))
    }

    pub fn upload_poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.upload_interval_ms.max(1))
    }

    pub fn boot_skip_after(&self) -> Duration {
        Duration::from_secs(self.boot.skip_after_secs)
    }

    pub fn auto_sync_delay(&self) -> Duration {
        Duration::from_secs(self.auto_sync.delay_secs)
    }

    /// Apply `CAPSULE_*` environment overrides on top of file values
    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = non_empty_env(ENV_API_BASE_URL) {
            self.api_base_url = url;
        }
        if let Some(token) = non_empty_env(ENV_ACCESS_TOKEN) {
            self.auth.access_token = Some(token);
        }
        if let Some(token) = non_empty_env(ENV_REFRESH_TOKEN) {
            self.auth.refresh_token = Some(token);
        }
    }

    /// Check values that would make every request fail
    pub fn validate(&self) -> Result<()> {
        let url = self.api_base_url.trim();
        if url.is_empty() {
            return Err(Error::Config("api_base_url is empty".to_string()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "api_base_url must start with http:// or https://, got {}",
                url
            )));
        }
        Ok(())
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Locates and loads the client configuration
///
/// Config file priority: explicit path (CLI) → `CAPSULE_CONFIG` → platform
/// default (`~/.config/capsule-sync/config.toml` on Linux).
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    cli_path: Option<PathBuf>,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Path of the config file that would be read (it may not exist)
    pub fn config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            return Some(path.clone());
        }
        if let Some(path) = non_empty_env(ENV_CONFIG_PATH) {
            return Some(PathBuf::from(path));
        }
        default_config_path()
    }

    /// Load the config file (or defaults) and apply environment overrides
    pub fn resolve(&self) -> Result<TomlConfig> {
        let mut config = match self.config_path() {
            Some(path) if path.exists() => {
                let config = load_toml_config(&path)?;
                info!("Loaded configuration from {}", path.display());
                config
            }
            Some(path) => {
                warn!(
                    "Config file not found at {}, using defaults",
                    path.display()
                );
                TomlConfig::default()
            }
            None => {
                warn!("Could not determine config directory, using defaults");
                TomlConfig::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }
}

/// Get default configuration file path for the platform
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Read and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Write a config file atomically (temp file + rename)
///
/// The file holds credentials, so on Unix it is created with mode 0600.
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    std::fs::write(&temp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    if let Err(err) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err.into());
    }

    Ok(())
}
