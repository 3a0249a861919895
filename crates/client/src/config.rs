//! Client configuration: local identity, keyring location and known nodes.
//!
//! Stored at `~/.config/fleet/client.toml`:
//!
//! ```toml
//! timeout_secs = 30
//!
//! [identity]
//! fingerprint = "a1b2:c3d4:e5f6:0718:293a:4b5c:6d7e:8f90"
//! keyring = "/home/ops/.config/fleet/keyring"
//!
//! [nodes.web-01]
//! address = "10.0.0.5:8080"
//! fingerprint = "0f1e:2d3c:4b5a:6978:8796:a5b4:c3d2:e1f0"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::Fingerprint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Client configuration errors.
#[derive(Debug, Error, PartialEq)]
pub enum ClientConfigError {
    #[error("timeout_secs must be between 1 and 3600 seconds, got {0}")]
    InvalidTimeout(u64),

    #[error("identity.fingerprint is not set; run `fleet keygen` first")]
    MissingIdentity,

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("node {0} already exists")]
    DuplicateNode(String),

    #[error("node name must be non-empty and must not contain whitespace: {0:?}")]
    InvalidNodeName(String),
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    default_base_dir().join("client.toml")
}

fn default_base_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fleet")
}

fn default_keyring_dir() -> PathBuf {
    default_base_dir().join("keyring")
}

fn default_timeout_secs() -> u64 {
    30
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Seconds to wait for a node before the outcome is undetermined.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// The operator's local identity.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Known nodes by name.
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeConfig>,
}

/// The operator's local identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityConfig {
    /// Fingerprint of the local signing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,

    /// Keyring directory.
    #[serde(default = "default_keyring_dir")]
    pub keyring: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            fingerprint: None,
            keyring: default_keyring_dir(),
        }
    }
}

/// A node the client can query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    /// `host:port` of the node's agent.
    pub address: String,

    /// Fingerprint the node's responses must be signed with.
    pub fingerprint: Fingerprint,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            identity: IdentityConfig::default(),
            nodes: BTreeMap::new(),
        }
    }
}

impl ClientConfig {
    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ClientConfigError> {
        if !(1..=3600).contains(&self.timeout_secs) {
            return Err(ClientConfigError::InvalidTimeout(self.timeout_secs));
        }
        Ok(())
    }

    /// Query timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The local signing fingerprint, required to send queries.
    pub fn identity(&self) -> Result<Fingerprint, ClientConfigError> {
        self.identity
            .fingerprint
            .ok_or(ClientConfigError::MissingIdentity)
    }

    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Result<&NodeConfig, ClientConfigError> {
        self.nodes
            .get(name)
            .ok_or_else(|| ClientConfigError::UnknownNode(name.to_string()))
    }

    /// Add a node. Names are unique.
    pub fn add_node(&mut self, name: &str, node: NodeConfig) -> Result<(), ClientConfigError> {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(ClientConfigError::InvalidNodeName(name.to_string()));
        }
        if self.nodes.contains_key(name) {
            return Err(ClientConfigError::DuplicateNode(name.to_string()));
        }
        self.nodes.insert(name.to_string(), node);
        Ok(())
    }

    /// Remove a node, returning it.
    pub fn remove_node(&mut self, name: &str) -> Result<NodeConfig, ClientConfigError> {
        self.nodes
            .remove(name)
            .ok_or_else(|| ClientConfigError::UnknownNode(name.to_string()))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| {
            let mut msg = e.message().to_string();
            if let Some(span) = e.span() {
                msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
            }
            anyhow::anyhow!("Invalid TOML configuration: {}", msg)
        })
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }
}
