//! One-shot sign-and-encrypt sealing built on the Noise `X` pattern.
//!
//! A sealed message is readable only by the holder of the recipient's secret
//! key, and it reveals the sender's static key to the recipient. The sender
//! additionally signs the plaintext with its Ed25519 key, binding the message
//! to the recipient's fingerprint.
//!
//! ## Noise X Pattern
//! ```text
//! <- s
//! ...
//! -> e, es, s, ss
//! ```
//!
//! The single handshake message carries a [`SealHeader`]; the plaintext then
//! follows as Noise transport messages, one per segment of a
//! [`SealedFrame`].

use serde::{Deserialize, Serialize};
use snow::Builder;

use crate::crypto::{Fingerprint, LocalIdentity, PeerIdentity, Signature, X25519_KEY_LENGTH};
use crate::error::{ProtocolError, Result};
use crate::framing::{SealedFrame, MAX_ENVELOPE_SIZE};

/// The Noise protocol pattern used for sealing.
///
/// Noise_X_25519_ChaChaPoly_BLAKE2s:
/// - X: one-way, sender static key transmitted, recipient static key known
/// - 25519: Curve25519 for DH key exchange
/// - ChaChaPoly: ChaCha20-Poly1305 for AEAD
/// - BLAKE2s: BLAKE2s for hashing
const SEAL_PATTERN: &str = "Noise_X_25519_ChaChaPoly_BLAKE2s";

/// Maximum size for a single Noise message.
pub const MAX_NOISE_MESSAGE_SIZE: usize = 65535;

/// Overhead added by Noise encryption (Poly1305 tag).
pub const NOISE_OVERHEAD: usize = 16;

/// Largest plaintext chunk carried by one transport message.
const CHUNK_SIZE: usize = MAX_NOISE_MESSAGE_SIZE - NOISE_OVERHEAD;

/// Domain separation prefix for envelope signatures.
const SIGNATURE_CONTEXT: &[u8] = b"fleet-envelope-v1";

/// Payload of the handshake message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealHeader {
    /// Ed25519 signature over [`signed_message`].
    signature: Signature,
    /// Total plaintext length in bytes.
    length: u64,
}

/// The result of unsealing a message with a local key.
///
/// The signature has not been verified yet: the caller must resolve
/// `sender_static` to a known identity first and then call [`Unsealed::verify`].
#[derive(Debug, Clone)]
pub struct Unsealed {
    /// The decrypted plaintext.
    pub plaintext: Vec<u8>,
    /// The sender's static X25519 key, authenticated by the Noise handshake.
    pub sender_static: [u8; X25519_KEY_LENGTH],
    /// Fingerprint of the local identity the message was sealed to.
    pub recipient: Fingerprint,
    signature: Signature,
}

impl Unsealed {
    /// Verifies the embedded signature against the claimed sender.
    ///
    /// Fails if the sender's X25519 key does not belong to `sender` or the
    /// signature does not cover this plaintext and recipient.
    pub fn verify(&self, sender: &PeerIdentity) -> Result<()> {
        if sender.x25519_public() != self.sender_static {
            return Err(ProtocolError::InvalidSignature(
                "sender key does not match handshake static key".to_string(),
            ));
        }
        let message = signed_message(&self.recipient, &self.plaintext);
        sender.verify(&message, &self.signature)
    }
}

fn signed_message(recipient: &Fingerprint, plaintext: &[u8]) -> Vec<u8> {
    let mut message =
        Vec::with_capacity(SIGNATURE_CONTEXT.len() + recipient.as_bytes().len() + plaintext.len());
    message.extend_from_slice(SIGNATURE_CONTEXT);
    message.extend_from_slice(recipient.as_bytes());
    message.extend_from_slice(plaintext);
    message
}

fn builder<'a>() -> Result<Builder<'a>> {
    let params = SEAL_PATTERN
        .parse()
        .map_err(|e| ProtocolError::Encryption(format!("invalid noise pattern: {}", e)))?;
    Ok(Builder::new(params))
}

/// Signs `plaintext` with `signer` and encrypts it to `recipient`.
pub fn seal(plaintext: &[u8], signer: &LocalIdentity, recipient: &PeerIdentity) -> Result<Vec<u8>> {
    let header = SealHeader {
        signature: signer.sign(&signed_message(&recipient.fingerprint(), plaintext)),
        length: plaintext.len() as u64,
    };
    let header_bytes = rmp_serde::to_vec(&header)?;

    let local_secret = signer.x25519_secret();
    let remote_public = recipient.x25519_public();
    let mut handshake = builder()?
        .local_private_key(&local_secret)
        .remote_public_key(&remote_public)
        .build_initiator()?;

    let mut buffer = vec![0u8; MAX_NOISE_MESSAGE_SIZE];
    let chunk_count = plaintext.len().div_ceil(CHUNK_SIZE);
    let mut segments = Vec::with_capacity(1 + chunk_count);

    let len = handshake.write_message(&header_bytes, &mut buffer)?;
    segments.push(buffer[..len].to_vec());

    let mut transport = handshake.into_transport_mode()?;
    for chunk in plaintext.chunks(CHUNK_SIZE) {
        let len = transport.write_message(chunk, &mut buffer)?;
        segments.push(buffer[..len].to_vec());
    }

    SealedFrame::new(segments).encode()
}

/// Decrypts a sealed message addressed to `recipient`.
pub fn unseal(ciphertext: &[u8], recipient: &LocalIdentity) -> Result<Unsealed> {
    let frame = SealedFrame::decode(ciphertext)?;
    let (first, rest) = frame
        .segments
        .split_first()
        .ok_or_else(|| ProtocolError::Decryption("sealed message has no segments".to_string()))?;

    let local_secret = recipient.x25519_secret();
    let mut handshake = builder()?
        .local_private_key(&local_secret)
        .build_responder()?;

    let mut buffer = vec![0u8; MAX_NOISE_MESSAGE_SIZE];
    let len = handshake.read_message(first, &mut buffer)?;
    let header: SealHeader = rmp_serde::from_slice(&buffer[..len])?;

    if header.length > MAX_ENVELOPE_SIZE as u64 {
        return Err(ProtocolError::FrameTooLarge {
            size: header.length as usize,
            max: MAX_ENVELOPE_SIZE,
        });
    }

    let remote = handshake.get_remote_static().ok_or_else(|| {
        ProtocolError::Decryption("sender static key not available".to_string())
    })?;
    let mut sender_static = [0u8; X25519_KEY_LENGTH];
    sender_static.copy_from_slice(remote);

    let mut transport = handshake.into_transport_mode()?;
    let mut plaintext = Vec::with_capacity(header.length as usize);
    for segment in rest {
        let len = transport.read_message(segment, &mut buffer)?;
        plaintext.extend_from_slice(&buffer[..len]);
    }

    if plaintext.len() as u64 != header.length {
        return Err(ProtocolError::Decryption(format!(
            "plaintext length mismatch: header says {}, got {}",
            header.length,
            plaintext.len()
        )));
    }

    Ok(Unsealed {
        plaintext,
        sender_static,
        recipient: recipient.fingerprint(),
        signature: header.signature,
    })
}
