//! # Fleet Agent Library
//!
//! The agent runs on every managed host. It accepts signed, encrypted
//! commands from trusted operators and runs them against the host.
//!
//! ## Overview
//!
//! - **Listener**: accepts TCP connections and serves each on its own task
//! - **Request handling**: a per-connection state machine that decodes the
//!   envelope, authenticates the sender and dispatches the command
//! - **Modules**: named sets of action handlers, addressed as `module.action`
//! - **Package management**: adapters for the host's package manager
//!
//! ## Request flow
//!
//! ```text
//! TCP accept
//!     │
//!     ▼
//! request line ─► headers ─► body ─► open envelope ─► trusted signer?
//!                                                          │
//!                                         no ◄─────────────┤ yes
//!                                         │                ▼
//!                                   403 (bare)     parse command ─► registry ─► handler
//!                                                                                 │
//!                                                          sealed ActionResult ◄──┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agent::{modules, packages, Config, Listener, RequestContext};
//! use protocol::{EnvelopeCodec, Keyring};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(agent::config::DEFAULT_CONFIG_DIR)?;
//!     let keyring = Arc::new(Keyring::open(&config.keyring.path)?);
//!     let local = config.fingerprint()?;
//!     keyring.select_local(&local)?;
//!
//!     let registry = modules::registry(&modules::ModuleContext {
//!         packages: packages::detect(),
//!     })?;
//!     let context = RequestContext::new(
//!         EnvelopeCodec::new(keyring, local),
//!         registry,
//!         config.server.timeout(),
//!     );
//!
//!     let listener = Listener::bind(config.server.socket_addr()?, context).await?;
//!     listener.run(CancellationToken::new()).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration directory loading and validation
//! - [`logging`]: Main and request log sinks
//! - [`listener`]: TCP accept loop
//! - [`request`]: Per-connection request handling
//! - [`modules`]: Action modules and the registry
//! - [`packages`]: System package manager adapters

pub mod config;
pub mod listener;
pub mod logging;
pub mod modules;
pub mod packages;
pub mod request;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};
pub use listener::Listener;
pub use logging::LogGuard;
pub use modules::{AgentModule, Handler, ModuleContext};
pub use packages::{PackageError, PackageManager, RefreshOutcome};
pub use request::RequestContext;
