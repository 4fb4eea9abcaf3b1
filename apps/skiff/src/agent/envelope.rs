//! Sealed envelope framing for the agent's status endpoint.
//!
//! The agent serves `{version, nonce, ciphertext}` where the ciphertext is
//! ChaCha20-Poly1305 under a key expanded from the per-session key that was
//! minted when the host was provisioned. Key derivation and distribution are
//! the provisioner's business; this module only seals and opens.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

pub const ENVELOPE_VERSION: u32 = 1;

const STATUS_KEY_INFO: &[u8] = b"skiff agent status v1";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// 32-byte session key shared with the agent on a provisioned host.
#[derive(Clone, PartialEq, Eq)]
pub struct AgentKey([u8; KEY_LEN]);

impl AgentKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, EnvelopeError> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|err| EnvelopeError::Key(err.to_string()))?;
        let bytes: [u8; KEY_LEN] = raw
            .try_into()
            .map_err(|_| EnvelopeError::Key(format!("expected {KEY_LEN} bytes")))?;
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    fn material(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

// Key material must never end up in logs or error chains.
impl fmt::Debug for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AgentKey(..)")
    }
}

impl Serialize for AgentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for AgentKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        AgentKey::from_base64(&raw).map_err(D::Error::custom)
    }
}

/// Wire form of one encrypted status document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub version: u32,
    pub nonce: String,
    pub ciphertext: String,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("unsupported envelope version {0}")]
    Version(u32),
    #[error("invalid encoding: {0}")]
    Encoding(String),
    #[error("unexpected nonce length")]
    NonceLength,
    #[error("failed to encrypt payload")]
    Encrypt,
    #[error("failed to decrypt payload")]
    Decrypt,
    #[error("invalid key: {0}")]
    Key(String),
}

fn derive_status_key(key: &AgentKey) -> Result<Key, EnvelopeError> {
    let hkdf = Hkdf::<Sha256>::new(None, key.material());
    let mut expanded = [0u8; KEY_LEN];
    hkdf.expand(STATUS_KEY_INFO, &mut expanded)
        .map_err(|_| EnvelopeError::Key("hkdf expand failed".into()))?;
    Ok(Key::from(expanded))
}

pub fn seal_envelope(key: &AgentKey, plaintext: &[u8]) -> Result<SealedEnvelope, EnvelopeError> {
    let status_key = derive_status_key(key)?;
    let cipher = ChaCha20Poly1305::new(&status_key);

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| EnvelopeError::Encrypt)?;

    Ok(SealedEnvelope {
        version: ENVELOPE_VERSION,
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
}

pub fn open_envelope(key: &AgentKey, envelope: &SealedEnvelope) -> Result<Vec<u8>, EnvelopeError> {
    if envelope.version != ENVELOPE_VERSION {
        return Err(EnvelopeError::Version(envelope.version));
    }

    let nonce = BASE64
        .decode(&envelope.nonce)
        .map_err(|err| EnvelopeError::Encoding(err.to_string()))?;
    if nonce.len() != NONCE_LEN {
        return Err(EnvelopeError::NonceLength);
    }
    let ciphertext = BASE64
        .decode(&envelope.ciphertext)
        .map_err(|err| EnvelopeError::Encoding(err.to_string()))?;

    let status_key = derive_status_key(key)?;
    let cipher = ChaCha20Poly1305::new(&status_key);
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|_| EnvelopeError::Decrypt)
}
