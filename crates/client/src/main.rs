//! Fleet Client
//!
//! Sends commands to fleet agents.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use client::config::default_config_path;
use client::{Client, ClientConfig, ClientError, NodeConfig, EXIT_CONFIG, EXIT_USAGE};
use protocol::{Keyring, PublicKeyBundle, TrustLevel};

/// Fleet - send signed, encrypted commands to managed hosts.
#[derive(Parser, Debug)]
#[command(name = "fleet")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the client configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run an action on a node
    Request {
        /// Node name
        node: String,

        /// Action address, `module.action`
        action: String,

        /// Action arguments: `key=value` or `--flag`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Generate the local signing key
    Keygen {
        /// Display name for the key
        #[arg(long, default_value = "operator")]
        name: String,
    },

    /// Print the local public key bundle, for import on agents
    Export,

    /// Manage the client configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Manage known nodes
    #[command(subcommand)]
    Node(NodeCommands),
}

/// Subcommands for node management.
#[derive(Subcommand, Debug, Clone)]
pub enum NodeCommands {
    /// Add a node and trust its key
    Add {
        /// Node name
        name: String,

        /// Agent address, `host:port`
        address: String,

        /// The node's public key bundle file, or `-` for standard input
        key: PathBuf,
    },

    /// Remove a node
    Rm {
        /// Node name
        name: String,
    },

    /// List known nodes
    List,
}

/// A fatal error and the exit status it maps to.
#[derive(Debug)]
struct Failure {
    exit_code: i32,
    error: anyhow::Error,
}

impl Failure {
    fn config(error: impl Into<anyhow::Error>) -> Self {
        Self {
            exit_code: EXIT_CONFIG,
            error: error.into(),
        }
    }

    fn runtime(error: impl Into<anyhow::Error>) -> Self {
        Self {
            exit_code: 1,
            error: error.into(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version also come through here
            let code = if e.use_stderr() { EXIT_USAGE } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli).await {
        Ok(code) => std::process::exit(code),
        Err(failure) => {
            eprintln!("Error: {:#}", failure.error);
            std::process::exit(failure.exit_code);
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32, Failure> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = ClientConfig::load(&config_path).map_err(Failure::config)?;
    config.validate().map_err(Failure::config)?;

    match cli.command {
        Commands::Request { node, action, args } => request(config, &node, &action, &args).await,
        Commands::Keygen { name } => keygen(config, &config_path, name).map(|()| 0),
        Commands::Export => export(&config).map(|()| 0),
        Commands::Config(ConfigCommands::Node(command)) => {
            node(config, &config_path, command).map(|()| 0)
        }
    }
}

fn open_keyring(config: &ClientConfig) -> Result<Keyring, Failure> {
    Keyring::open(&config.identity.keyring)
        .with_context(|| {
            format!(
                "Failed to open keyring {}",
                config.identity.keyring.display()
            )
        })
        .map_err(Failure::config)
}

async fn request(
    config: ClientConfig,
    node: &str,
    action: &str,
    args: &[String],
) -> Result<i32, Failure> {
    let keyring = Arc::new(open_keyring(&config)?);
    let client = Client::new(config, keyring).map_err(|e| Failure {
        exit_code: e.exit_code(),
        error: e.into(),
    })?;

    match client.request(node, action, args).await {
        Ok(formatted) => {
            if !formatted.display.is_empty() {
                println!("{}", formatted.display);
            }
            Ok(formatted.exit_code)
        }
        Err(e) => {
            let exit_code = e.exit_code();
            let undetermined = matches!(&e, ClientError::Query(query) if query.is_undetermined());
            let error = if undetermined {
                anyhow::Error::new(e).context("Outcome undetermined")
            } else {
                e.into()
            };
            Err(Failure { exit_code, error })
        }
    }
}

fn keygen(mut config: ClientConfig, config_path: &Path, name: String) -> Result<(), Failure> {
    if let Some(existing) = config.identity.fingerprint {
        return Err(Failure::runtime(anyhow::anyhow!(
            "Identity {} already configured in {}",
            existing,
            config_path.display()
        )));
    }

    let keyring = open_keyring(&config)?;
    let fingerprint = keyring.generate(name);
    keyring.save().map_err(Failure::runtime)?;

    config.identity.fingerprint = Some(fingerprint);
    config.save(config_path).map_err(Failure::runtime)?;
    println!("{}", fingerprint);
    Ok(())
}

fn export(config: &ClientConfig) -> Result<(), Failure> {
    let fingerprint = config.identity().map_err(Failure::config)?;
    let keyring = open_keyring(config)?;
    let bundle = keyring.export(&fingerprint).map_err(Failure::runtime)?;
    println!("{}", bundle.to_json().map_err(Failure::runtime)?);
    Ok(())
}

fn read_bundle(file: &Path) -> anyhow::Result<PublicKeyBundle> {
    let json = if file.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin())
            .context("Failed to read key bundle from standard input")?
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read key bundle {}", file.display()))?
    };
    Ok(PublicKeyBundle::from_json(&json)?)
}

fn node(mut config: ClientConfig, config_path: &Path, command: NodeCommands) -> Result<(), Failure> {
    match command {
        NodeCommands::Add { name, address, key } => {
            if config.nodes.contains_key(&name) {
                return Err(Failure::runtime(anyhow::anyhow!("Node {} already exists", name)));
            }
            let bundle = read_bundle(&key).map_err(Failure::runtime)?;
            let keyring = open_keyring(&config)?;
            let fingerprint = keyring
                .import(&bundle, TrustLevel::Trusted)
                .map_err(Failure::runtime)?;
            keyring.save().map_err(Failure::runtime)?;

            config
                .add_node(
                    &name,
                    NodeConfig {
                        address,
                        fingerprint,
                    },
                )
                .map_err(Failure::runtime)?;
            config.save(config_path).map_err(Failure::runtime)?;
            println!("Added node {} ({})", name, fingerprint);
        }
        NodeCommands::Rm { name } => {
            let removed = config.remove_node(&name).map_err(Failure::runtime)?;
            config.save(config_path).map_err(Failure::runtime)?;
            println!("Removed node {} ({})", name, removed.fingerprint);
        }
        NodeCommands::List => {
            if config.nodes.is_empty() {
                println!("No nodes configured.");
            }
            for (name, node) in &config.nodes {
                println!("{:<20} {:<24} {}", name, node.address, node.fingerprint);
            }
        }
    }
    Ok(())
}
