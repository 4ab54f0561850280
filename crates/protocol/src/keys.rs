//! Authentication key material for device handshakes.
//!
//! A host proves its identity to a device by signing the device's random
//! token with one of its stored key pairs. Devices remember the public keys
//! they have accepted, so a key that was accepted once is reused on every
//! later handshake. Keys are Ed25519; they persist as base64 JSON.

use ed25519_dalek::{
    Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH,
    SECRET_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Number of hash bytes shown in a key fingerprint.
pub const KEY_FINGERPRINT_LENGTH: usize = 16;

/// Length of the random token a device asks the host to sign.
pub const AUTH_TOKEN_LENGTH: usize = 20;

/// Formats a fingerprint as colon separated groups of 4 hex characters.
fn fingerprint_of(public_key: &[u8; PUBLIC_KEY_LENGTH]) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(public_key);
    hash[..KEY_FINGERPRINT_LENGTH]
        .chunks(2)
        .map(hex::encode)
        .collect::<Vec<_>>()
        .join(":")
}

/// A 64-byte signature over a device auth token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthSignature(pub [u8; SIGNATURE_LENGTH]);

impl AuthSignature {
    /// Creates a signature from raw bytes.
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of this signature.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }
}

/// The public half of an auth key, as remembered by a device.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuthPublicKey([u8; PUBLIC_KEY_LENGTH]);

impl AuthPublicKey {
    /// Creates a public key from raw bytes, rejecting points that are not valid keys.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self> {
        VerifyingKey::from_bytes(bytes).map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
        Ok(Self(*bytes))
    }

    /// Returns the raw bytes of this key.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    /// Verifies a token signature made with the matching secret key.
    pub fn verify(&self, token: &[u8], signature: &AuthSignature) -> Result<()> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
        key.verify(token, &Ed25519Signature::from_bytes(signature.as_bytes()))
            .map_err(ProtocolError::from)
    }

    /// Human-readable fingerprint, e.g. `a1b2:c3d4:e5f6:7890:1234:5678:9abc:def0`.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.0)
    }
}

impl std::fmt::Debug for AuthPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AuthPublicKey").field(&self.fingerprint()).finish()
    }
}

/// A host authentication key pair.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "StoredKeyPair", into = "StoredKeyPair")]
pub struct AuthKeyPair {
    /// The Ed25519 signing key (secret key).
    signing_key: SigningKey,
    /// Free-form label, conventionally `user@host`.
    label: String,
}

impl AuthKeyPair {
    /// Generates a new random key pair using the OS random number generator.
    pub fn generate(label: impl Into<String>) -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            label: label.into(),
        }
    }

    /// Restores a key pair from raw secret key bytes.
    pub fn from_secret_key_bytes(bytes: &[u8; SECRET_KEY_LENGTH], label: impl Into<String>) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
            label: label.into(),
        }
    }

    /// Returns the secret key bytes.
    ///
    /// Only use this for persisting the key.
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Returns the public half of the pair.
    pub fn public_key(&self) -> AuthPublicKey {
        AuthPublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Returns the key label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Signs a device auth token.
    pub fn sign(&self, token: &[u8]) -> AuthSignature {
        AuthSignature(self.signing_key.sign(token).to_bytes())
    }

    /// Fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        self.public_key().fingerprint()
    }
}

impl std::fmt::Debug for AuthKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthKeyPair")
            .field("label", &self.label)
            .field("fingerprint", &self.fingerprint())
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// On-disk form of a key pair.
#[derive(Serialize, Deserialize)]
struct StoredKeyPair {
    label: String,
    /// Base64 secret key bytes.
    secret_key: String,
}

impl From<AuthKeyPair> for StoredKeyPair {
    fn from(pair: AuthKeyPair) -> Self {
        use base64::Engine;
        Self {
            secret_key: base64::engine::general_purpose::STANDARD.encode(pair.secret_key_bytes()),
            label: pair.label,
        }
    }
}

impl TryFrom<StoredKeyPair> for AuthKeyPair {
    type Error = ProtocolError;

    fn try_from(stored: StoredKeyPair) -> Result<Self> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&stored.secret_key)
            .map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
        let bytes: [u8; SECRET_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
            ProtocolError::InvalidKey(format!(
                "invalid secret key length: expected {}, got {}",
                SECRET_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(AuthKeyPair::from_secret_key_bytes(&bytes, stored.label))
    }
}
