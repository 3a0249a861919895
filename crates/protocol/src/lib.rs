//! # Fleet Protocol Library
//!
//! Protocol definitions and cryptographic primitives shared by the fleet
//! agent and client.
//!
//! ## Overview
//!
//! Every command is individually signed and encrypted; there is no separate
//! channel security. This crate provides:
//!
//! - **Keyring**: local secret keys, counterpart public keys and their trust
//! - **Sealing**: one-shot sign-and-encrypt built on the Noise `X` pattern
//! - **Envelope Codec**: JSON values to sealed bytes and back
//! - **Dispatch**: `module.action` addressing and a closed module registry
//! - **Transport**: one HTTP/1.1-shaped request and response per connection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       Command / ActionResult            │  JSON
//! ├─────────────────────────────────────────┤
//! │   Ed25519 signature + Noise X sealing   │  ChaCha20-Poly1305
//! ├─────────────────────────────────────────┤
//! │          Segment framing                │  "FLTE", length-prefixed
//! ├─────────────────────────────────────────┤
//! │   HTTP/1.1 framing over TCP             │  Content-Length body
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use protocol::{Command, EnvelopeCodec, Keyring, Parameters, TrustLevel};
//!
//! let dir = std::env::temp_dir().join("fleet-doc-example");
//! let agent = Arc::new(Keyring::new(dir.join("agent")));
//! let operator = Arc::new(Keyring::new(dir.join("operator")));
//! let agent_fp = agent.generate("web-01");
//! let operator_fp = operator.generate("ops");
//!
//! // Exchange public keys
//! agent.import(&operator.export(&operator_fp).unwrap(), TrustLevel::Trusted).unwrap();
//! operator.import(&agent.export(&agent_fp).unwrap(), TrustLevel::Trusted).unwrap();
//!
//! let client = EnvelopeCodec::new(operator, operator_fp);
//! let server = EnvelopeCodec::new(agent, agent_fp);
//!
//! let command = Command::new("packagemanagement.refresh", Parameters::new());
//! let body = client.encode(&command, &agent_fp).unwrap();
//! let (received, signer): (Command, _) = server.decode(&body).unwrap();
//! assert_eq!(received, command);
//! assert_eq!(signer, operator_fp);
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: identities, fingerprints and signatures
//! - [`keyring`]: the identity and trust store
//! - [`seal`]: sign-and-encrypt sealing
//! - [`framing`]: sealed envelope segment framing
//! - [`envelope`]: the envelope codec
//! - [`messages`]: commands, results and status codes
//! - [`dispatch`]: addresses and the module registry
//! - [`transport`]: wire request/response framing
//! - [`error`]: error types

pub mod crypto;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod keyring;
pub mod messages;
pub mod seal;
pub mod transport;

pub use crypto::{Fingerprint, LocalIdentity, PeerIdentity, Signature, FINGERPRINT_LENGTH};
pub use dispatch::{Address, DispatchError, Registry, RegistryBuilder, RegistryError};
pub use envelope::{Envelope, EnvelopeCodec, EnvelopeError};
pub use error::{ProtocolError, Result};
pub use framing::{SealedFrame, FRAME_MAGIC, FRAME_VERSION, MAX_ENVELOPE_SIZE};
pub use keyring::{
    CryptoError, KeyEntry, Keyring, KeyringError, Opened, PublicKeyBundle, TrustLevel,
};
pub use messages::{ActionResult, Command, Parameters, StatusCode};
pub use transport::{Request, Response, WireError, MAX_REQUEST_LINE};
