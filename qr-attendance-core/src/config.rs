//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/qr-attendance-logger/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/qr-attendance-logger/` (~/.config/qr-attendance-logger/)
//! - Data: `$XDG_DATA_HOME/qr-attendance-logger/` (~/.local/share/qr-attendance-logger/)
//! - State/Logs: `$XDG_STATE_HOME/qr-attendance-logger/` (~/.local/state/qr-attendance-logger/)
//!
//! Credentials are normally supplied through the environment:
//! `QR_LOGGER_CONNECTION_STRING`, or `QR_LOGGER_ACCOUNT_NAME` together with
//! `QR_LOGGER_SAS_TOKEN`.

use crate::error::{Error, Result};
use crate::fallback::DEFAULT_FALLBACK_FILE;
use crate::record::DEFAULT_BLOB_FILE_NAME;
use crate::sink::Credentials;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "qr-attendance-logger";

/// Base name of the log file; rotated files carry a date suffix
pub const LOG_FILE_NAME: &str = "qr-attendance.log";

/// Environment variable holding a full connection string
pub const ENV_CONNECTION_STRING: &str = "QR_LOGGER_CONNECTION_STRING";
/// Environment variable holding the storage account name
pub const ENV_ACCOUNT_NAME: &str = "QR_LOGGER_ACCOUNT_NAME";
/// Environment variable holding the SAS token
pub const ENV_SAS_TOKEN: &str = "QR_LOGGER_SAS_TOKEN";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Remote store settings
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Delivery worker settings
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote append-blob store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    /// Blob container records are written to
    #[serde(default = "default_container")]
    pub container: String,

    /// File name of each monthly log inside its partition
    #[serde(default = "default_blob_file_name")]
    pub blob_file_name: String,

    /// Blob endpoint override (e.g. a local emulator)
    pub endpoint: Option<String>,

    /// Connection string (environment takes precedence)
    pub connection_string: Option<String>,

    /// Storage account name (environment takes precedence)
    pub account_name: Option<String>,

    /// SAS token (environment takes precedence)
    pub sas_token: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            container: default_container(),
            blob_file_name: default_blob_file_name(),
            endpoint: None,
            connection_string: None,
            account_name: None,
            sas_token: None,
        }
    }
}

fn default_container() -> String {
    "qr-attendance".to_string()
}

fn default_blob_file_name() -> String {
    DEFAULT_BLOB_FILE_NAME.to_string()
}

impl RemoteConfig {
    /// Resolve credentials from the process environment, then this config
    pub fn credentials(&self) -> Result<Credentials> {
        self.credentials_with(|name| std::env::var(name).ok())
    }

    /// Resolve credentials using `env` as the environment.
    ///
    /// Order: connection string variable, account name + SAS token
    /// variables, `connection_string` from the file, `account_name` +
    /// `sas_token` from the file.
    pub fn credentials_with<F>(&self, env: F) -> Result<Credentials>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.resolve_credentials(env).map(|(credentials, _)| credentials)
    }

    /// Where [`credentials`](Self::credentials) would take its values from,
    /// or `None` when nothing is configured
    pub fn credential_source(&self) -> Option<CredentialSource> {
        self.resolve_credentials(|name| std::env::var(name).ok())
            .ok()
            .map(|(_, source)| source)
    }

    fn resolve_credentials<F>(&self, env: F) -> Result<(Credentials, CredentialSource)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        if let Some(conn) = env(ENV_CONNECTION_STRING) {
            return Ok((
                Credentials::ConnectionString(conn),
                CredentialSource::Environment,
            ));
        }
        if let (Some(account), Some(token)) = (env(ENV_ACCOUNT_NAME), env(ENV_SAS_TOKEN)) {
            return Ok((
                Credentials::Sas { account, token },
                CredentialSource::Environment,
            ));
        }
        if let Some(conn) = &self.connection_string {
            return Ok((
                Credentials::ConnectionString(conn.clone()),
                CredentialSource::ConfigFile,
            ));
        }
        if let (Some(account), Some(token)) = (&self.account_name, &self.sas_token) {
            return Ok((
                Credentials::Sas {
                    account: account.clone(),
                    token: token.clone(),
                },
                CredentialSource::ConfigFile,
            ));
        }

        Err(Error::Config(format!(
            "no storage credentials: set {} or both {} and {}",
            ENV_CONNECTION_STRING, ENV_ACCOUNT_NAME, ENV_SAS_TOKEN
        )))
    }
}

/// Origin of the resolved storage credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Environment,
    ConfigFile,
}

impl std::fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialSource::Environment => write!(f, "environment"),
            CredentialSource::ConfigFile => write!(f, "config file"),
        }
    }
}

/// Delivery worker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Timeout for a single remote append in seconds
    #[serde(default = "default_append_timeout")]
    pub append_timeout_secs: u64,

    /// Pause after every delivery attempt in milliseconds
    #[serde(default = "default_cycle_delay")]
    pub cycle_delay_ms: u64,

    /// File name of the local fallback log inside the data directory
    #[serde(default = "default_fallback_file")]
    pub fallback_file: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            append_timeout_secs: default_append_timeout(),
            cycle_delay_ms: default_cycle_delay(),
            fallback_file: default_fallback_file(),
        }
    }
}

impl DeliveryConfig {
    pub fn append_timeout(&self) -> Duration {
        Duration::from_secs(self.append_timeout_secs)
    }

    pub fn cycle_delay(&self) -> Duration {
        Duration::from_millis(self.cycle_delay_ms)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.append_timeout_secs == 0 {
            return Err(Error::Config(
                "delivery.append_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.fallback_file.is_empty() || self.fallback_file.contains(['/', '\\']) {
            return Err(Error::Config(
                "delivery.fallback_file must be a plain file name".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_append_timeout() -> u64 {
    5
}

fn default_cycle_delay() -> u64 {
    300
}

fn default_fallback_file() -> String {
    DEFAULT_FALLBACK_FILE.to_string()
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.delivery.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/qr-attendance-logger/config.toml`
    pub fn config_path() -> PathBuf {
        xdg_config_home().join(APP_DIR).join("config.toml")
    }

    /// Returns the working directory holding the fallback file
    ///
    /// `$XDG_DATA_HOME/qr-attendance-logger/`
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join(APP_DIR)
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/qr-attendance-logger/`
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join(APP_DIR)
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/qr-attendance-logger/qr-attendance.log`, before
    /// the daily rotation suffix
    pub fn log_path() -> PathBuf {
        Self::state_dir().join(LOG_FILE_NAME)
    }

    /// Returns the fallback file path for this configuration
    pub fn fallback_path(&self) -> PathBuf {
        Self::data_dir().join(&self.delivery.fallback_file)
    }
}
