//! Identity & trust store.
//!
//! The keyring is a directory holding two JSON files:
//!
//! - `pubring.json`: counterpart public keys and their trust level
//! - `secring.json`: local secret keys (mode 0600 on Unix)
//!
//! Every operation, including signing, encryption and decryption, goes
//! through a single mutex. The keyring is shared by all connection workers in
//! a process and they take turns on it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{Fingerprint, LocalIdentity, PeerIdentity};
use crate::error::ProtocolError;
use crate::seal::{self, Unsealed};

/// File name of the public keyring inside the keyring directory.
pub const PUBRING_FILE: &str = "pubring.json";

/// File name of the secret keyring inside the keyring directory.
pub const SECRING_FILE: &str = "secring.json";

/// Current on-disk format version.
const KEYRING_VERSION: u32 = 1;

/// Trust level of a public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Imported but not yet vouched for.
    #[default]
    Unknown,
    /// Allowed to authenticate envelopes and receive them.
    Trusted,
    /// Explicitly denied.
    Untrusted,
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TrustLevel::Unknown => "unknown",
            TrustLevel::Trusted => "trusted",
            TrustLevel::Untrusted => "untrusted",
        };
        f.write_str(label)
    }
}

/// A public key held in the keyring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    /// Fingerprint derived from the public key.
    pub fingerprint: Fingerprint,
    /// Human-readable name for the key owner.
    pub name: String,
    /// The Ed25519 public key.
    #[serde(with = "base64_key")]
    pub public_key: [u8; 32],
    /// Trust level of this key.
    pub trust_level: TrustLevel,
    /// When the key was imported.
    pub added_at: SystemTime,
}

impl KeyEntry {
    /// Creates a new entry for the given peer.
    pub fn new(name: impl Into<String>, peer: &PeerIdentity, trust_level: TrustLevel) -> Self {
        Self {
            fingerprint: peer.fingerprint(),
            name: name.into(),
            public_key: peer.public_key_bytes(),
            trust_level,
            added_at: SystemTime::now(),
        }
    }

    /// Returns true if the key is trusted.
    pub fn is_trusted(&self) -> bool {
        self.trust_level == TrustLevel::Trusted
    }
}

/// Portable public key export, exchanged between hosts and operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyBundle {
    /// Human-readable name for the key owner.
    pub name: String,
    /// The Ed25519 public key.
    #[serde(with = "base64_key")]
    pub public_key: [u8; 32],
    /// Fingerprint claimed by the exporter; checked on import when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
}

impl PublicKeyBundle {
    /// Parses a bundle from JSON.
    pub fn from_json(json: &str) -> Result<Self, KeyringError> {
        serde_json::from_str(json).map_err(|e| KeyringError::InvalidKey(e.to_string()))
    }

    /// Serializes the bundle to pretty JSON.
    pub fn to_json(&self) -> Result<String, KeyringError> {
        serde_json::to_string_pretty(self).map_err(|e| KeyringError::InvalidKey(e.to_string()))
    }
}

/// The outcome of [`Keyring::decrypt_and_identify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Opened {
    /// Decrypted plaintext, empty if decryption failed.
    pub plaintext: Vec<u8>,
    /// The signer, present only if the signature verified against a trusted key.
    pub signer: Option<Fingerprint>,
}

/// Errors from keyring storage and management.
#[derive(Debug, Error)]
pub enum KeyringError {
    /// Reading or writing a keyring file failed.
    #[error("keyring i/o error at {path}: {source}")]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A keyring file is not valid JSON in the expected shape.
    #[error("failed to parse keyring file {path}: {source}")]
    Parse {
        /// The offending file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A key is malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A stored or claimed fingerprint does not match the key it names.
    #[error("fingerprint mismatch: expected {expected}, key has {actual}")]
    FingerprintMismatch {
        /// The fingerprint that was claimed.
        expected: Fingerprint,
        /// The fingerprint computed from the key.
        actual: Fingerprint,
    },

    /// No public key with this fingerprint.
    #[error("key {0} not found in keyring")]
    KeyNotFound(Fingerprint),

    /// No local secret key with this fingerprint.
    #[error("no secret key for {0} in keyring")]
    MissingSecretKey(Fingerprint),
}

/// Errors from [`Keyring::sign_and_encrypt`].
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The recipient's public key is not in the keyring.
    #[error("recipient key {0} is not in the keyring")]
    UnknownKey(Fingerprint),

    /// The recipient's public key is present but not trusted.
    #[error("recipient key {0} is not trusted")]
    UntrustedKey(Fingerprint),

    /// The signer has no secret key in the keyring.
    #[error("no secret key available for signer {0}")]
    MissingSecretKey(Fingerprint),

    /// Sealing failed.
    #[error(transparent)]
    Seal(#[from] ProtocolError),
}

/// Serde support for 32-byte keys (serialized as base64).
mod base64_key {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(key);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: String = Deserialize::deserialize(deserializer)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .map_err(serde::de::Error::custom)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom(format!(
                "invalid key length: expected 32, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(arr)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PubringData {
    version: u32,
    keys: Vec<KeyEntry>,
}

#[derive(Serialize, Deserialize)]
struct SecretKeyRecord {
    name: String,
    #[serde(with = "base64_key")]
    secret_key: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct SecringData {
    version: u32,
    keys: Vec<SecretKeyRecord>,
}

struct StoredKey {
    entry: KeyEntry,
    peer: PeerIdentity,
}

struct LocalKey {
    name: String,
    identity: LocalIdentity,
}

#[derive(Default)]
struct KeyringState {
    public: BTreeMap<Fingerprint, StoredKey>,
    secret: Vec<LocalKey>,
}

impl KeyringState {
    fn local(&self, fingerprint: &Fingerprint) -> Option<&LocalKey> {
        self.secret
            .iter()
            .find(|key| key.identity.fingerprint() == *fingerprint)
    }

    /// Resolves the sender of an unsealed message to a trusted fingerprint.
    fn identify(&self, unsealed: &Unsealed) -> Option<Fingerprint> {
        let stored = self
            .public
            .values()
            .find(|stored| stored.peer.x25519_public() == unsealed.sender_static);

        let Some(stored) = stored else {
            tracing::debug!("envelope signer is not in the keyring");
            return None;
        };

        if !stored.entry.is_trusted() {
            tracing::debug!(
                "envelope signer {} has trust level {}",
                stored.entry.fingerprint,
                stored.entry.trust_level
            );
            return None;
        }

        match unsealed.verify(&stored.peer) {
            Ok(()) => Some(stored.entry.fingerprint),
            Err(e) => {
                tracing::debug!(
                    "signature from {} did not verify: {}",
                    stored.entry.fingerprint,
                    e
                );
                None
            }
        }
    }
}

/// Process-wide identity and trust store.
pub struct Keyring {
    dir: PathBuf,
    state: Mutex<KeyringState>,
}

impl Keyring {
    /// Creates an empty keyring that will persist to the given directory.
    ///
    /// This does not load anything; call `load()` to read existing data.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            state: Mutex::new(KeyringState::default()),
        }
    }

    /// Creates a keyring and loads it from the given directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, KeyringError> {
        let keyring = Self::new(dir);
        keyring.load()?;
        Ok(keyring)
    }

    /// Returns the keyring directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state(&self) -> MutexGuard<'_, KeyringState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads both keyring files.
    ///
    /// Missing files leave the corresponding half of the keyring empty.
    pub fn load(&self) -> Result<(), KeyringError> {
        let mut public = BTreeMap::new();
        let pubring_path = self.dir.join(PUBRING_FILE);
        if let Some(data) = read_json::<PubringData>(&pubring_path)? {
            for entry in data.keys {
                let peer = PeerIdentity::from_public_key_bytes(&entry.public_key)
                    .map_err(|e| KeyringError::InvalidKey(e.to_string()))?;
                if peer.fingerprint() != entry.fingerprint {
                    return Err(KeyringError::FingerprintMismatch {
                        expected: entry.fingerprint,
                        actual: peer.fingerprint(),
                    });
                }
                public.insert(entry.fingerprint, StoredKey { entry, peer });
            }
        }

        let mut secret = Vec::new();
        let secring_path = self.dir.join(SECRING_FILE);
        if let Some(data) = read_json::<SecringData>(&secring_path)? {
            for record in data.keys {
                secret.push(LocalKey {
                    name: record.name,
                    identity: LocalIdentity::from_secret_key_bytes(&record.secret_key),
                });
            }
        }

        tracing::info!(
            "Loaded {} public and {} secret keys from {:?}",
            public.len(),
            secret.len(),
            self.dir
        );

        let mut state = self.state();
        state.public = public;
        state.secret = secret;
        Ok(())
    }

    /// Saves both keyring files.
    ///
    /// Uses atomic writes (temp file, then rename) and creates the keyring
    /// directory if it doesn't exist.
    pub fn save(&self) -> Result<(), KeyringError> {
        let state = self.state();

        create_private_dir(&self.dir)?;

        let pubring = PubringData {
            version: KEYRING_VERSION,
            keys: state.public.values().map(|s| s.entry.clone()).collect(),
        };
        write_json(&self.dir.join(PUBRING_FILE), &pubring, false)?;

        let secring = SecringData {
            version: KEYRING_VERSION,
            keys: state
                .secret
                .iter()
                .map(|key| SecretKeyRecord {
                    name: key.name.clone(),
                    secret_key: key.identity.secret_key_bytes(),
                })
                .collect(),
        };
        write_json(&self.dir.join(SECRING_FILE), &secring, true)?;

        tracing::debug!(
            "Saved {} public and {} secret keys to {:?}",
            pubring.keys.len(),
            secring.keys.len(),
            self.dir
        );
        Ok(())
    }

    /// Generates a new local secret key and returns its fingerprint.
    ///
    /// Does not automatically save; call `save()` after making changes.
    pub fn generate(&self, name: impl Into<String>) -> Fingerprint {
        let identity = LocalIdentity::generate();
        let fingerprint = identity.fingerprint();
        let name = name.into();

        tracing::info!("Generated secret key {} ({})", fingerprint, name);
        self.state().secret.push(LocalKey { name, identity });
        fingerprint
    }

    /// Adds a local secret key.
    ///
    /// Does not automatically save; call `save()` after making changes.
    pub fn add_secret(&self, name: impl Into<String>, identity: LocalIdentity) -> Fingerprint {
        let fingerprint = identity.fingerprint();
        let mut state = self.state();
        state.secret.retain(|key| key.identity.fingerprint() != fingerprint);
        state.secret.push(LocalKey {
            name: name.into(),
            identity,
        });
        fingerprint
    }

    /// Imports a public key with the given trust level.
    ///
    /// If the key already exists, its name and trust level are updated.
    /// Does not automatically save; call `save()` after making changes.
    pub fn import(
        &self,
        bundle: &PublicKeyBundle,
        trust_level: TrustLevel,
    ) -> Result<Fingerprint, KeyringError> {
        let peer = PeerIdentity::from_public_key_bytes(&bundle.public_key)
            .map_err(|e| KeyringError::InvalidKey(e.to_string()))?;
        let fingerprint = peer.fingerprint();

        if let Some(claimed) = bundle.fingerprint {
            if claimed != fingerprint {
                return Err(KeyringError::FingerprintMismatch {
                    expected: claimed,
                    actual: fingerprint,
                });
            }
        }

        tracing::info!(
            "Importing key {} ({}) with trust level {}",
            fingerprint,
            bundle.name,
            trust_level
        );

        let entry = KeyEntry::new(bundle.name.clone(), &peer, trust_level);
        self.state()
            .public
            .insert(fingerprint, StoredKey { entry, peer });
        Ok(fingerprint)
    }

    /// Removes a public key.
    ///
    /// Returns the removed entry if it existed.
    /// Does not automatically save; call `save()` after making changes.
    pub fn remove(&self, fingerprint: &Fingerprint) -> Option<KeyEntry> {
        let removed = self.state().public.remove(fingerprint).map(|s| s.entry);
        if let Some(ref entry) = removed {
            tracing::info!("Removed key {} ({})", entry.fingerprint, entry.name);
        }
        removed
    }

    /// Updates the trust level of a public key.
    pub fn set_trust(
        &self,
        fingerprint: &Fingerprint,
        level: TrustLevel,
    ) -> Result<(), KeyringError> {
        let mut state = self.state();
        let stored = state
            .public
            .get_mut(fingerprint)
            .ok_or(KeyringError::KeyNotFound(*fingerprint))?;

        tracing::info!(
            "Changing trust level for key {} ({}) from {} to {}",
            fingerprint,
            stored.entry.name,
            stored.entry.trust_level,
            level
        );

        stored.entry.trust_level = level;
        Ok(())
    }

    /// Gets a public key entry.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<KeyEntry> {
        self.state()
            .public
            .get(fingerprint)
            .map(|s| s.entry.clone())
    }

    /// Returns true only if the key exists and is trusted.
    pub fn is_trusted(&self, fingerprint: &Fingerprint) -> bool {
        self.state()
            .public
            .get(fingerprint)
            .map(|s| s.entry.is_trusted())
            .unwrap_or(false)
    }

    /// Lists all public keys, ordered by fingerprint.
    pub fn list(&self) -> Vec<KeyEntry> {
        self.state()
            .public
            .values()
            .map(|s| s.entry.clone())
            .collect()
    }

    /// Lists the fingerprints and names of all local secret keys.
    pub fn local_keys(&self) -> Vec<(Fingerprint, String)> {
        self.state()
            .secret
            .iter()
            .map(|key| (key.identity.fingerprint(), key.name.clone()))
            .collect()
    }

    /// Exports a public key bundle for a local or public key.
    pub fn export(&self, fingerprint: &Fingerprint) -> Result<PublicKeyBundle, KeyringError> {
        let state = self.state();
        if let Some(local) = state.local(fingerprint) {
            return Ok(PublicKeyBundle {
                name: local.name.clone(),
                public_key: local.identity.public_key_bytes(),
                fingerprint: Some(*fingerprint),
            });
        }
        state
            .public
            .get(fingerprint)
            .map(|stored| PublicKeyBundle {
                name: stored.entry.name.clone(),
                public_key: stored.entry.public_key,
                fingerprint: Some(*fingerprint),
            })
            .ok_or(KeyringError::KeyNotFound(*fingerprint))
    }

    /// Checks that exactly one local secret key matches `fingerprint`.
    ///
    /// This is the startup contract of every process that signs envelopes.
    pub fn select_local(&self, fingerprint: &Fingerprint) -> Result<(), KeyringError> {
        let matches = self
            .state()
            .secret
            .iter()
            .filter(|key| key.identity.fingerprint() == *fingerprint)
            .count();

        match matches {
            1 => Ok(()),
            _ => Err(KeyringError::MissingSecretKey(*fingerprint)),
        }
    }

    /// Signs `plaintext` with the local key `signer` and encrypts it to the
    /// trusted public key `recipient`.
    pub fn sign_and_encrypt(
        &self,
        plaintext: &[u8],
        recipient: &Fingerprint,
        signer: &Fingerprint,
    ) -> Result<Vec<u8>, CryptoError> {
        let state = self.state();

        let local = state
            .local(signer)
            .ok_or(CryptoError::MissingSecretKey(*signer))?;
        let stored = state
            .public
            .get(recipient)
            .ok_or(CryptoError::UnknownKey(*recipient))?;
        if !stored.entry.is_trusted() {
            return Err(CryptoError::UntrustedKey(*recipient));
        }

        Ok(seal::seal(plaintext, &local.identity, &stored.peer)?)
    }

    /// Decrypts `ciphertext` with whichever local key it was sealed to and
    /// identifies the signer.
    ///
    /// Never fails: undecryptable input yields empty plaintext and no signer,
    /// and a signer that is unknown, untrusted or whose signature does not
    /// verify yields no signer.
    pub fn decrypt_and_identify(&self, ciphertext: &[u8]) -> Opened {
        let state = self.state();

        for local in &state.secret {
            match seal::unseal(ciphertext, &local.identity) {
                Ok(unsealed) => {
                    let signer = state.identify(&unsealed);
                    return Opened {
                        plaintext: unsealed.plaintext,
                        signer,
                    };
                }
                Err(e) => {
                    tracing::trace!(
                        "envelope not readable with key {}: {}",
                        local.identity.fingerprint(),
                        e
                    );
                }
            }
        }

        Opened::default()
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring").field("dir", &self.dir).finish()
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, KeyringError> {
    if !path.exists() {
        tracing::debug!("Keyring file not found at {:?}, starting empty", path);
        return Ok(None);
    }

    let contents = fs::read_to_string(path).map_err(|source| KeyringError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|source| KeyringError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json<T: Serialize>(path: &Path, value: &T, private: bool) -> Result<(), KeyringError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| KeyringError::Io { path, source }
    };

    let contents = serde_json::to_string_pretty(value)
        .map_err(|e| KeyringError::InvalidKey(e.to_string()))?;

    // Atomic write: write to temp file, then rename
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, contents).map_err(io_err(&temp_path))?;

    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o600))
            .map_err(io_err(&temp_path))?;
    }
    #[cfg(not(unix))]
    let _ = private;

    fs::rename(&temp_path, path).map_err(io_err(path))
}

fn create_private_dir(dir: &Path) -> Result<(), KeyringError> {
    if dir.exists() {
        return Ok(());
    }

    fs::create_dir_all(dir).map_err(|source| KeyringError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(|source| {
            KeyringError::Io {
                path: dir.to_path_buf(),
                source,
            }
        })?;
    }

    Ok(())
}
