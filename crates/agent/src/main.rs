//! Fleet Agent
//!
//! Serves signed, encrypted commands from trusted operators.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use agent::config::{default_config_dir, Config};
use agent::{logging, modules, packages, Listener, ModuleContext, RequestContext};
use anyhow::Context;
use clap::{Parser, Subcommand};
use protocol::{EnvelopeCodec, Fingerprint, Keyring, PublicKeyBundle, TrustLevel};
use tokio_util::sync::CancellationToken;

/// Exit status for command line usage errors.
const EXIT_USAGE: i32 = 64;
/// Exit status for configuration errors.
const EXIT_CONFIG: i32 = 78;

/// Fleet Agent - executes signed, encrypted commands on this host.
#[derive(Parser, Debug)]
#[command(name = "fleet-agent")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration directory
    #[arg(short, long, global = true, value_name = "DIR")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the agent.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start serving requests
    Run,

    /// Manage the agent's keyring
    #[command(subcommand)]
    Keys(KeysCommands),
}

/// Subcommands for keyring management.
#[derive(Subcommand, Debug, Clone)]
pub enum KeysCommands {
    /// Generate a new local key
    Keygen {
        /// Display name for the key
        name: String,
    },

    /// Import an operator's public key bundle
    Import {
        /// Bundle file, or `-` for standard input
        file: PathBuf,

        /// Import without trusting the key
        #[arg(long)]
        pending: bool,
    },

    /// List public and local keys
    List,

    /// Trust a key
    Trust {
        /// Key fingerprint
        fingerprint: Fingerprint,
    },

    /// Mark a key as untrusted
    Untrust {
        /// Key fingerprint
        fingerprint: Fingerprint,
    },

    /// Remove a public key
    Remove {
        /// Key fingerprint
        fingerprint: Fingerprint,
    },

    /// Print a public key bundle (the agent's own key by default)
    Export {
        /// Key fingerprint
        fingerprint: Option<Fingerprint>,
    },
}

/// A fatal error and the exit status it maps to.
#[derive(Debug)]
enum Failure {
    Config(anyhow::Error),
    Runtime(anyhow::Error),
}

impl Failure {
    fn config(error: impl Into<anyhow::Error>) -> Self {
        Failure::Config(error.into())
    }

    fn runtime(error: impl Into<anyhow::Error>) -> Self {
        Failure::Runtime(error.into())
    }

    fn exit_code(&self) -> i32 {
        match self {
            Failure::Config(_) => EXIT_CONFIG,
            Failure::Runtime(_) => 1,
        }
    }

    fn report(&self) {
        match self {
            Failure::Config(e) => eprintln!("Configuration error: {:#}", e),
            Failure::Runtime(e) => eprintln!("Error: {:#}", e),
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

    if let Err(failure) = dispatch(cli).await {
        failure.report();
        std::process::exit(failure.exit_code());
    }
}

async fn dispatch(cli: Cli) -> Result<(), Failure> {
    let config_dir = cli.config.clone().unwrap_or_else(default_config_dir);
    let mut config = Config::load(&config_dir).map_err(Failure::config)?;
    config.apply_env_overrides();
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    config.validate().map_err(Failure::config)?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Keys(command) => {
            tracing_subscriber::fmt()
                .with_env_filter(config.logging.level.to_lowercase())
                .with_writer(std::io::stderr)
                .init();
            keys(&config, command)
        }
    }
}

async fn run(config: Config) -> Result<(), Failure> {
    let _log_guard = logging::init(&config.logging).map_err(Failure::config)?;
    tracing::info!("Fleet agent {} starting", env!("CARGO_PKG_VERSION"));

    let local = config.fingerprint().map_err(Failure::config)?;
    let keyring = Keyring::open(&config.keyring.path)
        .with_context(|| format!("Failed to open keyring {}", config.keyring.path.display()))
        .map_err(Failure::config)?;
    keyring.select_local(&local).map_err(Failure::config)?;
    tracing::info!(
        "Serving as {} with {} public key(s)",
        local,
        keyring.list().len()
    );

    let registry = modules::registry(&ModuleContext {
        packages: packages::detect(),
    })
    .map_err(Failure::runtime)?;
    let context = RequestContext::new(
        EnvelopeCodec::new(Arc::new(keyring), local),
        registry,
        config.server.timeout(),
    );

    let addr = config.server.socket_addr().map_err(Failure::config)?;
    let listener = Listener::bind(addr, context)
        .await
        .with_context(|| format!("Failed to bind {}", addr))
        .map_err(Failure::runtime)?;

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(listener.run(shutdown.clone()));

    wait_for_shutdown_signal().await;
    tracing::info!("Received shutdown signal");
    shutdown.cancel();

    server.await.map_err(Failure::runtime)?;
    tracing::info!("Fleet agent stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!("Failed to register signal handlers: {}; using Ctrl-C", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

fn open_keyring(config: &Config) -> Result<Keyring, Failure> {
    Keyring::open(&config.keyring.path)
        .with_context(|| format!("Failed to open keyring {}", config.keyring.path.display()))
        .map_err(Failure::config)
}

fn read_bundle(file: &PathBuf) -> anyhow::Result<PublicKeyBundle> {
    let json = if file.as_os_str() == "-" {
        let mut json = String::new();
        std::io::stdin()
            .read_to_string(&mut json)
            .context("Failed to read key bundle from standard input")?;
        json
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read key bundle {}", file.display()))?
    };
    Ok(PublicKeyBundle::from_json(&json)?)
}

fn keys(config: &Config, command: KeysCommands) -> Result<(), Failure> {
    let keyring = open_keyring(config)?;

    match command {
        KeysCommands::Keygen { name } => {
            let fingerprint = keyring.generate(name);
            keyring.save().map_err(Failure::runtime)?;
            println!("{}", fingerprint);
            eprintln!(
                "Set `fingerprint = \"{}\"` under [keyring] to serve with this key",
                fingerprint
            );
        }
        KeysCommands::Import { file, pending } => {
            let bundle = read_bundle(&file).map_err(Failure::runtime)?;
            let level = if pending {
                TrustLevel::Unknown
            } else {
                TrustLevel::Trusted
            };
            let fingerprint = keyring.import(&bundle, level).map_err(Failure::runtime)?;
            keyring.save().map_err(Failure::runtime)?;
            println!("Imported {} ({}) as {}", fingerprint, bundle.name, level);
        }
        KeysCommands::List => {
            let local = keyring.local_keys();
            let public = keyring.list();
            if local.is_empty() && public.is_empty() {
                println!("Keyring is empty.");
            }
            for (fingerprint, name) in local {
                println!("{}  {:<9}  {}", fingerprint, "local", name);
            }
            for entry in public {
                println!(
                    "{}  {:<9}  {}",
                    entry.fingerprint,
                    entry.trust_level.to_string(),
                    entry.name
                );
            }
        }
        KeysCommands::Trust { fingerprint } => {
            keyring
                .set_trust(&fingerprint, TrustLevel::Trusted)
                .map_err(Failure::runtime)?;
            keyring.save().map_err(Failure::runtime)?;
            println!("Key {} is now trusted", fingerprint);
        }
        KeysCommands::Untrust { fingerprint } => {
            keyring
                .set_trust(&fingerprint, TrustLevel::Untrusted)
                .map_err(Failure::runtime)?;
            keyring.save().map_err(Failure::runtime)?;
            println!("Key {} is no longer trusted", fingerprint);
        }
        KeysCommands::Remove { fingerprint } => {
            if keyring.remove(&fingerprint).is_none() {
                return Err(Failure::runtime(anyhow::anyhow!(
                    "No public key {}",
                    fingerprint
                )));
            }
            keyring.save().map_err(Failure::runtime)?;
            println!("Key {} removed", fingerprint);
        }
        KeysCommands::Export { fingerprint } => {
            let fingerprint = match fingerprint {
                Some(fingerprint) => fingerprint,
                None => config.fingerprint().map_err(Failure::config)?,
            };
            let bundle = keyring.export(&fingerprint).map_err(Failure::runtime)?;
            println!("{}", bundle.to_json().map_err(Failure::runtime)?);
        }
    }

    Ok(())
}
