//! Envelope codec: values to sealed wire bytes and back.
//!
//! Encoding serializes a value to JSON and hands it to the keyring for
//! sign-and-encrypt; the ciphertext is the whole request or response body.
//! Decoding runs the body through decrypt-and-identify and only then parses
//! the plaintext.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::crypto::Fingerprint;
use crate::keyring::{CryptoError, Keyring, Opened};
use crate::messages::StatusCode;

/// Errors from encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Decryption produced nothing, or the signer is absent or not trusted.
    #[error("envelope failed authentication")]
    AuthenticationFailure,

    /// The plaintext is not a valid message.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The value could not be serialized.
    #[error("failed to serialize payload: {0}")]
    Serialization(String),

    /// Sign-and-encrypt failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl EnvelopeError {
    /// Status reported to the peer for this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            EnvelopeError::AuthenticationFailure => Some(StatusCode::Forbidden),
            EnvelopeError::MalformedPayload(_) => Some(StatusCode::BadRequest),
            EnvelopeError::Serialization(_) | EnvelopeError::Crypto(_) => None,
        }
    }
}

/// A decrypted envelope.
///
/// Lives for one request or response and is never persisted.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The ciphertext as received.
    pub ciphertext: Vec<u8>,
    /// The signer, present only if it is trusted and its signature verified.
    pub signer: Option<Fingerprint>,
    /// The decrypted plaintext, empty if decryption failed.
    pub plaintext: Vec<u8>,
}

impl Envelope {
    fn from_opened(ciphertext: Vec<u8>, opened: Opened) -> Self {
        Self {
            ciphertext,
            signer: opened.signer,
            plaintext: opened.plaintext,
        }
    }

    /// Returns true if decryption produced a non-empty plaintext and the
    /// signer is known.
    pub fn is_authentic(&self) -> bool {
        !self.plaintext.is_empty() && self.signer.is_some()
    }

    /// Returns the signer of an authentic envelope.
    pub fn authenticated_signer(&self) -> Result<Fingerprint, EnvelopeError> {
        match self.signer {
            Some(signer) if !self.plaintext.is_empty() => Ok(signer),
            _ => Err(EnvelopeError::AuthenticationFailure),
        }
    }

    /// Parses the plaintext as JSON.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_slice(&self.plaintext)
            .map_err(|e| EnvelopeError::MalformedPayload(e.to_string()))
    }
}

/// Encodes and decodes envelopes on behalf of one local identity.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    keyring: Arc<Keyring>,
    local: Fingerprint,
}

impl EnvelopeCodec {
    /// Create a codec that signs with `local`.
    pub fn new(keyring: Arc<Keyring>, local: Fingerprint) -> Self {
        Self { keyring, local }
    }

    /// The local fingerprint used for signing.
    pub fn local(&self) -> Fingerprint {
        self.local
    }

    /// The keyring backing this codec.
    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    /// Serializes `value` and seals it to `recipient`.
    pub fn encode<T: Serialize>(
        &self,
        value: &T,
        recipient: &Fingerprint,
    ) -> Result<Vec<u8>, EnvelopeError> {
        let plaintext =
            serde_json::to_vec(value).map_err(|e| EnvelopeError::Serialization(e.to_string()))?;
        Ok(self
            .keyring
            .sign_and_encrypt(&plaintext, recipient, &self.local)?)
    }

    /// Decrypts `body` and identifies its signer. Never fails.
    pub fn open(&self, body: &[u8]) -> Envelope {
        Envelope::from_opened(body.to_vec(), self.keyring.decrypt_and_identify(body))
    }

    /// Opens `body`, requires it to be authentic and parses it.
    pub fn decode<T: DeserializeOwned>(
        &self,
        body: &[u8],
    ) -> Result<(T, Fingerprint), EnvelopeError> {
        let envelope = self.open(body);
        let signer = envelope.authenticated_signer()?;
        let value = envelope.parse()?;
        Ok((value, signer))
    }
}
