//! Configuration management for the fleet agent.
//!
//! The agent reads a configuration *directory*: every file in it whose name
//! does not start with a dot is parsed as TOML, in sorted order, and the
//! resulting tables are merged key by key (later files win). The default
//! directory is `/etc/fleet/agent.d`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::Fingerprint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port must be greater than 0")]
    InvalidPort,

    #[error("timeout_secs must be between 1 and 3600 seconds, got {0}")]
    InvalidTimeout(u64),

    #[error("address is not a valid IP address: {0}")]
    InvalidAddress(String),

    #[error("keyring.fingerprint is not a valid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("keyring.fingerprint is not set")]
    MissingFingerprint,

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
pub const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default configuration directory.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/fleet/agent.d";

/// Main configuration structure for the fleet agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener configuration.
    pub server: ServerConfig,

    /// Keyring location and local identity.
    pub keyring: KeyringConfig,

    /// Log sinks.
    pub logging: LoggingConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// IP address to listen on.
    pub address: String,

    /// TCP port to listen on.
    pub port: u16,

    /// Read timeout for each phase of a request, in seconds.
    pub timeout_secs: u64,
}

/// Keyring configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeyringConfig {
    /// Keyring directory.
    pub path: PathBuf,

    /// Fingerprint of the agent's own secret key.
    pub fingerprint: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Main log file. Standard error when absent.
    pub main_log: Option<PathBuf>,

    /// Request log file. Shares the main log when absent.
    pub request_log: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8080,
            timeout_secs: 30,
        }
    }
}

impl Default for KeyringConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/etc/fleet/keyring"),
            fingerprint: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            main_log: None,
            request_log: None,
        }
    }
}

/// Returns the default configuration directory.
pub fn default_config_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_DIR)
}

impl ServerConfig {
    /// The socket address to bind.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = self
            .address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.address.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// The per-phase read timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - FLEET_LOG_LEVEL: Override log level
    /// - FLEET_ADDRESS: Override listen address
    /// - FLEET_PORT: Override listen port
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("FLEET_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }

        if let Ok(address) = std::env::var("FLEET_ADDRESS") {
            if !address.is_empty() {
                tracing::info!("Overriding address from environment: {}", address);
                self.server.address = address;
            }
        }

        if let Ok(port) = std::env::var("FLEET_PORT") {
            match port.parse() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.server.port = port;
                }
                Err(_) => tracing::warn!("Ignoring invalid FLEET_PORT: {:?}", port),
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if !(1..=3600).contains(&self.server.timeout_secs) {
            return Err(ConfigError::InvalidTimeout(self.server.timeout_secs));
        }

        self.server.socket_addr()?;

        if let Some(fingerprint) = &self.keyring.fingerprint {
            fingerprint
                .parse::<Fingerprint>()
                .map_err(|_| ConfigError::InvalidFingerprint(fingerprint.clone()))?;
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// The agent's own fingerprint, required to serve.
    pub fn fingerprint(&self) -> Result<Fingerprint, ConfigError> {
        let fingerprint = self
            .keyring
            .fingerprint
            .as_ref()
            .ok_or(ConfigError::MissingFingerprint)?;
        fingerprint
            .parse()
            .map_err(|_| ConfigError::InvalidFingerprint(fingerprint.clone()))
    }

    /// Load configuration from a directory.
    ///
    /// Unlike a single config file, a missing directory is an error: the
    /// agent cannot serve without a keyring fingerprint.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();

        let mut files = Vec::new();
        let entries = fs::read_dir(dir)
            .with_context(|| format!("Failed to read config directory: {}", dir.display()))?;
        for entry in entries {
            let entry = entry
                .with_context(|| format!("Failed to read config directory: {}", dir.display()))?;
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            let path = entry.path();
            if !hidden && path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        let mut merged = toml::Table::new();
        for path in &files {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let table: toml::Table = toml::from_str(&contents).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to parse config file: {}: {}",
                    path.display(),
                    format_toml_error(&e)
                )
            })?;
            merge_tables(&mut merged, table);
            tracing::debug!("Merged config file {:?}", path);
        }

        Self::deserialize(toml::Value::Table(merged))
            .map_err(|e| anyhow::anyhow!("Invalid configuration in {}: {}", dir.display(), e))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Merges `overlay` into `base`; nested tables merge, anything else replaces.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const FINGERPRINT: &str = "0123:4567:89ab:cdef:0123:4567:89ab:cdef";

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.address, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.timeout_secs, 30);
        assert_eq!(config.keyring.path, PathBuf::from("/etc/fleet/keyring"));
        assert!(config.keyring.fingerprint.is_none());
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[server]
port = 9000

[keyring]
fingerprint = "0123:4567:89ab:cdef:0123:4567:89ab:cdef"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.address, "127.0.0.1");
        assert_eq!(config.fingerprint().unwrap().to_string(), FINGERPRINT);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[server\nport = 1");
        assert!(result.unwrap_err().to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_roundtrip() {
        let mut original = Config::default();
        original.keyring.fingerprint = Some(FINGERPRINT.to_string());
        original.logging.request_log = Some(PathBuf::from("/var/log/fleet/request.log"));

        let loaded = Config::from_toml(&original.to_toml().unwrap()).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_merges_files_in_order() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("00-base.toml"),
            "[server]\naddress = \"0.0.0.0\"\nport = 8080\n\n[logging]\nlevel = \"debug\"\n",
        )
        .unwrap();
        fs::write(temp_dir.path().join("10-site.toml"), "[server]\nport = 9090\n").unwrap();
        fs::write(temp_dir.path().join(".hidden"), "[server]\nport = 1\n").unwrap();

        let config = Config::load(temp_dir.path()).unwrap();

        assert_eq!(config.server.address, "0.0.0.0");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_empty_directory_is_default() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(Config::load(temp_dir.path()).unwrap(), Config::default());
    }

    #[test]
    fn test_load_missing_directory() {
        let result = Config::load("/nonexistent/fleet/agent.d");
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to read config directory"));
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("agent.toml"), "invalid [ toml").unwrap();

        let err = Config::load(temp_dir.path()).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_load_wrong_type() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("agent.toml"), "[server]\nport = \"http\"\n").unwrap();

        assert!(Config::load(temp_dir.path()).is_err());
    }

    #[test]
    fn test_merge_tables_replaces_scalars_and_merges_tables() {
        let mut base: toml::Table = toml::from_str("a = 1\n[t]\nx = 1\ny = 2\n").unwrap();
        let overlay: toml::Table = toml::from_str("a = 2\n[t]\ny = 3\n").unwrap();

        merge_tables(&mut base, overlay);

        assert_eq!(base["a"].as_integer(), Some(2));
        assert_eq!(base["t"]["x"].as_integer(), Some(1));
        assert_eq!(base["t"]["y"].as_integer(), Some(3));
    }

    #[test]
    fn test_validate_port() {
        let mut config = Config::default();
        config.server.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort));
    }

    #[test]
    fn test_validate_timeout() {
        let mut config = Config::default();
        config.server.timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidTimeout(0)));

        config.server.timeout_secs = 3601;
        assert_eq!(config.validate(), Err(ConfigError::InvalidTimeout(3601)));

        config.server.timeout_secs = 3600;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_address() {
        let mut config = Config::default();
        config.server.address = "localhost".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_validate_fingerprint() {
        let mut config = Config::default();
        config.keyring.fingerprint = Some("not-a-fingerprint".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFingerprint(_))
        ));
    }

    #[test]
    fn test_missing_fingerprint() {
        assert_eq!(
            Config::default().fingerprint(),
            Err(ConfigError::MissingFingerprint)
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.logging.level = "verbose".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn test_socket_addr() {
        let config = Config::default();
        assert_eq!(
            config.server.socket_addr().unwrap(),
            "127.0.0.1:8080".parse().unwrap()
        );
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("FLEET_LOG_LEVEL", "trace");
        std::env::set_var("FLEET_ADDRESS", "0.0.0.0");
        std::env::set_var("FLEET_PORT", "9443");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("FLEET_LOG_LEVEL");
        std::env::remove_var("FLEET_ADDRESS");
        std::env::remove_var("FLEET_PORT");

        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.server.address, "0.0.0.0");
        assert_eq!(config.server.port, 9443);
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_port_ignored() {
        std::env::set_var("FLEET_PORT", "not-a-port");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("FLEET_PORT");

        assert_eq!(config.server.port, 8080);
    }

    #[test]
    #[serial]
    fn test_env_empty_values_ignored() {
        std::env::set_var("FLEET_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("FLEET_LOG_LEVEL");

        assert_eq!(config.logging.level, "info");
    }
}
