//! Credential store collaborator and its two stock implementations.
//!
//! A protocol client loads every stored key pair before a handshake and
//! offers them in turn. When the device accepts none of them, the client
//! generates a fresh pair and saves it here so the next handshake can reuse
//! it without another confirmation prompt on the device.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use protocol::{AuthKeyPair, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Persists and retrieves authentication key pairs.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Returns every stored key pair. Never fails just because nothing is stored.
    async fn load_keys(&self) -> Result<Vec<AuthKeyPair>>;

    /// Stores a newly generated key pair for later handshakes.
    async fn save_key(&self, key: &AuthKeyPair) -> Result<()>;
}

/// Keeps keys for the lifetime of the process only.
#[derive(Default)]
pub struct MemoryCredentialStore {
    keys: RwLock<Vec<AuthKeyPair>>,
}

impl MemoryCredentialStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with keys.
    pub fn with_keys(keys: Vec<AuthKeyPair>) -> Self {
        Self {
            keys: RwLock::new(keys),
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if no key is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load_keys(&self) -> Result<Vec<AuthKeyPair>> {
        Ok(self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn save_key(&self, key: &AuthKeyPair) -> Result<()> {
        tracing::info!(fingerprint = %key.fingerprint(), "Saving auth key in memory");
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key.clone());
        Ok(())
    }
}

/// Wrapper for serializing the key file.
#[derive(Debug, Serialize, Deserialize)]
struct KeyFileData {
    /// Version of the file format (for future migrations).
    version: u32,
    /// Stored key pairs, oldest first.
    keys: Vec<AuthKeyPair>,
}

impl Default for KeyFileData {
    fn default() -> Self {
        Self {
            version: 1,
            keys: Vec::new(),
        }
    }
}

/// Stores keys in a JSON file.
///
/// Writes go to a temporary file that is renamed over the key file.
pub struct FileCredentialStore {
    /// The path to the JSON file.
    path: PathBuf,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    /// Creates a store backed by the given file. The file need not exist yet.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Creates a store at the default path.
    pub fn with_default_path() -> Self {
        Self::new(default_key_file_path())
    }

    /// Returns the path to the key file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> AnyResult<KeyFileData> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            tracing::debug!("Key file not found at {:?}, starting empty", self.path);
            return Ok(KeyFileData::default());
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read key file: {}", self.path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse key file: {}", self.path.display()))
    }

    async fn write_file(&self, data: &KeyFileData) -> AnyResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create key directory: {}", parent.display())
            })?;
        }

        let contents = serde_json::to_string_pretty(data).context("Failed to serialize keys")?;

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &contents)
            .await
            .with_context(|| format!("Failed to write temp key file: {}", temp_path.display()))?;

        tokio::fs::rename(&temp_path, &self.path).await.with_context(|| {
            format!(
                "Failed to rename temp key file {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;

        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load_keys(&self) -> Result<Vec<AuthKeyPair>> {
        let data = self
            .read_file()
            .await
            .map_err(|e| ProtocolError::KeyStore(format!("{e:#}")))?;
        tracing::debug!("Loaded {} auth keys from {:?}", data.keys.len(), self.path);
        Ok(data.keys)
    }

    async fn save_key(&self, key: &AuthKeyPair) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let result: AnyResult<()> = async {
            let mut data = self.read_file().await?;
            if data
                .keys
                .iter()
                .any(|existing| existing.public_key() == key.public_key())
            {
                return Ok(());
            }
            data.keys.push(key.clone());
            self.write_file(&data).await
        }
        .await;

        result.map_err(|e| ProtocolError::KeyStore(format!("{e:#}")))?;
        tracing::info!(fingerprint = %key.fingerprint(), path = ?self.path, "Saved auth key");
        Ok(())
    }
}

/// Returns the default key file path.
pub fn default_key_file_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("adbshell")
        .join("adbkey.json")
}
