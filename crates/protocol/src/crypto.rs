//! Cryptographic identity and key management for fleet hosts and operators.
//!
//! Every identity is an Ed25519 keypair. The X25519 key used for envelope
//! encryption is derived from the same keypair, so a single fingerprint names
//! both the signing and the encryption key.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{
    Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH,
    SECRET_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Length of a fingerprint in bytes (SHA-256 output truncated to 16 bytes).
pub const FINGERPRINT_LENGTH: usize = 16;

/// Length of a derived X25519 key in bytes.
pub const X25519_KEY_LENGTH: usize = 32;

/// A key fingerprint derived from an Ed25519 public key.
///
/// This is the unit of trust and addressing: keyring entries, configured
/// node identities and envelope signers are all named by fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint([u8; FINGERPRINT_LENGTH]);

impl Fingerprint {
    /// Creates a fingerprint from raw bytes.
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of this fingerprint.
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LENGTH] {
        &self.0
    }

    /// Derives a fingerprint from a public key by hashing it with SHA-256.
    fn from_public_key(public_key: &VerifyingKey) -> Self {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(public_key.as_bytes());
        let mut id = [0u8; FINGERPRINT_LENGTH];
        id.copy_from_slice(&hash[..FINGERPRINT_LENGTH]);
        Self(id)
    }
}

/// Formatted as groups of 4 hex characters separated by colons,
/// for example: `a1b2:c3d4:e5f6:7890:1234:5678:9abc:def0`.
impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups = self
            .0
            .chunks(2)
            .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
            .collect::<Vec<_>>();
        write!(f, "{}", groups.join(":"))
    }
}

impl FromStr for Fingerprint {
    type Err = ProtocolError;

    /// Parses a fingerprint with or without colon separators, in either case.
    fn from_str(s: &str) -> Result<Self> {
        let compact: String = s.trim().chars().filter(|c| *c != ':').collect();
        if compact.len() != FINGERPRINT_LENGTH * 2 {
            return Err(ProtocolError::InvalidFingerprint(format!(
                "expected {} hex digits, got {}",
                FINGERPRINT_LENGTH * 2,
                compact.len()
            )));
        }

        let bytes = hex::decode(&compact)
            .map_err(|e| ProtocolError::InvalidFingerprint(e.to_string()))?;
        let mut id = [0u8; FINGERPRINT_LENGTH];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.to_string()
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    /// Creates a new Signature from raw bytes.
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of this signature.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    fn from_ed25519(sig: Ed25519Signature) -> Self {
        Self(sig.to_bytes())
    }

    fn as_ed25519(&self) -> Ed25519Signature {
        Ed25519Signature::from_bytes(&self.0)
    }
}

/// A local identity, including the secret key.
///
/// Local identities live in the secret keyring. They sign outgoing envelopes
/// and decrypt incoming ones.
#[derive(Clone)]
pub struct LocalIdentity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    fingerprint: Fingerprint,
}

impl LocalIdentity {
    /// Generates a new random identity using the operating system's CSPRNG.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Creates an identity from raw secret key bytes.
    ///
    /// The public key and fingerprint are derived from the secret key.
    pub fn from_secret_key_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let fingerprint = Fingerprint::from_public_key(&verifying_key);

        Self {
            signing_key,
            verifying_key,
            fingerprint,
        }
    }

    /// Returns the secret key bytes.
    ///
    /// **Security Warning**: The secret key should be kept confidential.
    /// Only use this method for secure storage.
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Returns the public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Returns the fingerprint of this identity.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Returns the public half of this identity.
    pub fn to_peer_identity(&self) -> PeerIdentity {
        PeerIdentity {
            verifying_key: self.verifying_key,
            fingerprint: self.fingerprint,
        }
    }

    /// Signs a message with this identity's secret key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_ed25519(self.signing_key.sign(message))
    }

    /// Verifies a signature made by this identity.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.verifying_key
            .verify(message, &signature.as_ed25519())
            .map_err(ProtocolError::from)
    }

    /// Returns the X25519 secret used for envelope decryption.
    ///
    /// These are the unclamped SHA-512 scalar bytes of the Ed25519 key; X25519
    /// clamps them, which yields the Montgomery form of the public key.
    pub fn x25519_secret(&self) -> [u8; X25519_KEY_LENGTH] {
        self.signing_key.to_scalar_bytes()
    }

    /// Returns the X25519 public key used for envelope encryption.
    pub fn x25519_public(&self) -> [u8; X25519_KEY_LENGTH] {
        self.verifying_key.to_montgomery().to_bytes()
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("fingerprint", &self.fingerprint)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// The public identity of a counterpart (host or operator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    verifying_key: VerifyingKey,
    fingerprint: Fingerprint,
}

impl PeerIdentity {
    /// Creates a PeerIdentity from public key bytes.
    pub fn from_public_key_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self> {
        let verifying_key = VerifyingKey::from_bytes(bytes)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;
        let fingerprint = Fingerprint::from_public_key(&verifying_key);

        Ok(Self {
            verifying_key,
            fingerprint,
        })
    }

    /// Creates a PeerIdentity from a slice, checking its length.
    pub fn from_public_key_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Self::from_public_key_bytes(&arr)
    }

    /// Returns the public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Returns the fingerprint of this peer.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Verifies a signature against a message using this peer's public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.verifying_key
            .verify(message, &signature.as_ed25519())
            .map_err(ProtocolError::from)
    }

    /// Returns the X25519 public key used to encrypt envelopes to this peer.
    pub fn x25519_public(&self) -> [u8; X25519_KEY_LENGTH] {
        self.verifying_key.to_montgomery().to_bytes()
    }
}
