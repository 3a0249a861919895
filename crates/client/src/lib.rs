//! # Fleet Client Library
//!
//! Sends signed, encrypted commands to fleet agents and interprets their
//! results.
//!
//! ## Overview
//!
//! - **Configuration**: the operator's identity and the nodes it manages
//! - **Query engine**: one connection per command, with the reply checked
//!   against the node's expected fingerprint
//! - **Modules**: per action, a request builder and a response formatter
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use client::{Client, ClientConfig};
//! use protocol::Keyring;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::load(client::config::default_config_path())?;
//!     let keyring = Arc::new(Keyring::open(&config.identity.keyring)?);
//!     let client = Client::new(config, keyring)?;
//!
//!     let formatted = client
//!         .request("web-01", "packagemanagement.refresh", &[])
//!         .await?;
//!     println!("{}", formatted.display);
//!     std::process::exit(formatted.exit_code);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Client configuration file
//! - [`query`]: Query engine and its errors
//! - [`modules`]: Client-side action modules
//! - [`request`]: Build, query and format in one call

pub mod config;
pub mod modules;
pub mod query;
pub mod request;

// Re-export protocol for convenience
pub use protocol;

pub use config::{ClientConfig, ClientConfigError, NodeConfig};
pub use modules::{BuildError, ClientModule, Formatted};
pub use query::{QueryEngine, QueryError, EXIT_CONFIG, EXIT_REJECTED, EXIT_UNDETERMINED};
pub use request::{Client, ClientError, EXIT_USAGE};
