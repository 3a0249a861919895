//! Sending one command to one node: build, query, format.

use std::sync::Arc;

use protocol::{
    Address, Command, DispatchError, EnvelopeCodec, Keyring, KeyringError, Registry, RegistryError,
};
use thiserror::Error;

use crate::config::{ClientConfig, ClientConfigError};
use crate::modules::{self, BuildError, ClientAction, Formatted};
use crate::query::{QueryEngine, QueryError, EXIT_CONFIG, EXIT_REJECTED};

/// Exit status for command line usage errors.
pub const EXIT_USAGE: i32 = 64;

/// Errors from [`Client::request`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ClientConfigError),

    #[error(transparent)]
    Keyring(#[from] KeyringError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl ClientError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Config(_) | ClientError::Keyring(_) => EXIT_CONFIG,
            ClientError::Dispatch(_) | ClientError::Build(_) => EXIT_USAGE,
            ClientError::Query(e) => e.exit_code(),
            ClientError::Registry(_) => 1,
        }
    }
}

/// A client bound to a configuration and keyring.
pub struct Client {
    config: ClientConfig,
    engine: QueryEngine,
    actions: Registry<ClientAction>,
}

impl Client {
    /// Create a client.
    ///
    /// Fails unless the keyring holds exactly one secret key for the
    /// configured identity.
    pub fn new(config: ClientConfig, keyring: Arc<Keyring>) -> Result<Self, ClientError> {
        let local = config.identity()?;
        keyring.select_local(&local)?;

        let actions = modules::registry()?;
        let engine = QueryEngine::new(EnvelopeCodec::new(keyring, local), config.timeout());
        Ok(Self {
            config,
            engine,
            actions,
        })
    }

    /// The client's configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run `address` on `node` with command line `args`.
    ///
    /// Results the node produced are returned formatted even when they
    /// report failure. A result carrying a protocol error status (the node
    /// rejected the command) maps to the rejected exit status.
    pub async fn request(
        &self,
        node: &str,
        address: &str,
        args: &[String],
    ) -> Result<Formatted, ClientError> {
        let node = self.config.node(node)?;
        let parsed = Address::parse(address)?;
        let action = self.actions.resolve(&parsed)?;
        let parameters = (action.build)(args)?;

        let command = Command::new(parsed.to_string(), parameters);
        let result = self
            .engine
            .query(&node.address, &node.fingerprint, &command)
            .await?;
        tracing::debug!(
            "{} returned success={} status={}",
            command.action,
            result.success,
            result.status
        );

        if result.status >= 400 {
            return Ok(Formatted {
                display: format!("{} failed: {} {}", command.action, result.status, result.message),
                exit_code: EXIT_REJECTED,
            });
        }
        Ok((action.format)(&result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use protocol::{Fingerprint, TrustLevel};
    use tempfile::TempDir;

    fn client(temp_dir: &TempDir) -> (Client, Fingerprint) {
        let keyring = Arc::new(Keyring::new(temp_dir.path().join("keyring")));
        let local = keyring.generate("ops");

        let node_keyring = Keyring::new(temp_dir.path().join("node"));
        let node_fp = node_keyring.generate("web-01");
        keyring
            .import(&node_keyring.export(&node_fp).unwrap(), TrustLevel::Trusted)
            .unwrap();

        let mut config = ClientConfig::default();
        config.identity.fingerprint = Some(local);
        config
            .add_node(
                "web-01",
                NodeConfig {
                    address: "127.0.0.1:1".to_string(),
                    fingerprint: node_fp,
                },
            )
            .unwrap();
        (Client::new(config, keyring).unwrap(), node_fp)
    }

    #[test]
    fn test_new_requires_identity() {
        let temp_dir = TempDir::new().unwrap();
        let keyring = Arc::new(Keyring::new(temp_dir.path()));

        let err = Client::new(ClientConfig::default(), keyring).err().unwrap();
        assert!(matches!(err, ClientError::Config(ClientConfigError::MissingIdentity)));
        assert_eq!(err.exit_code(), EXIT_CONFIG);
    }

    #[test]
    fn test_new_requires_secret_key() {
        let temp_dir = TempDir::new().unwrap();
        let keyring = Arc::new(Keyring::new(temp_dir.path()));
        let mut config = ClientConfig::default();
        config.identity.fingerprint = Some("a1b2:c3d4:e5f6:0718:293a:4b5c:6d7e:8f90".parse().unwrap());

        let err = Client::new(config, keyring).err().unwrap();
        assert!(matches!(err, ClientError::Keyring(KeyringError::MissingSecretKey(_))));
        assert_eq!(err.exit_code(), EXIT_CONFIG);
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let temp_dir = TempDir::new().unwrap();
        let (client, _) = client(&temp_dir);

        let err = client
            .request("db-01", "packagemanagement.refresh", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Config(ClientConfigError::UnknownNode(_))));
    }

    #[tokio::test]
    async fn test_unknown_action_is_usage_error() {
        let temp_dir = TempDir::new().unwrap();
        let (client, _) = client(&temp_dir);

        for address in ["packagemanagement.install", "nomodule.x", "nodot"] {
            let err = client.request("web-01", address, &[]).await.unwrap_err();
            assert_eq!(err.exit_code(), EXIT_USAGE, "{}", address);
        }
    }

    #[tokio::test]
    async fn test_bad_arguments_are_usage_error() {
        let temp_dir = TempDir::new().unwrap();
        let (client, _) = client(&temp_dir);

        let err = client
            .request("web-01", "packagemanagement.update", &["force".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Build(_)));
        assert_eq!(err.exit_code(), EXIT_USAGE);
    }
}
