//! Configuration management for adbshell.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/adbshell/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::ClientOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::default_key_file_path;
use crate::session::SessionOptions;
use crate::transfer::{DEFAULT_PUSH_CHUNK_SIZE, DEFAULT_PUSH_FILE_MODE, MAX_PUSH_CHUNK_SIZE};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("push_chunk_size must be between 1 and 65536, got {0}")]
    InvalidChunkSize(usize),

    #[error("push_file_mode must be at most 0o7777, got {0:#o}")]
    InvalidFileMode(u32),

    #[error("key_size must be one of 1024, 2048, 4096; got {0}")]
    InvalidKeySize(u32),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid auth key sizes, in bits.
const VALID_KEY_SIZES: &[u32] = &[1024, 2048, 4096];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Protocol client flags.
    pub client: ClientConfig,

    /// File transfer configuration.
    pub transfer: TransferConfig,

    /// Auth key storage.
    pub keys: KeysConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Flags passed to the transport and protocol client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Log protocol exchanges.
    pub debug: bool,

    /// Compute and verify payload checksums.
    pub use_checksum: bool,

    /// Dump every raw transport packet.
    pub dump: bool,

    /// Size of newly generated auth keys, in bits.
    pub key_size: u32,
}

/// File transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per DATA chunk when pushing files.
    pub push_chunk_size: usize,

    /// Permission bits applied to every pushed file.
    pub push_file_mode: u32,
}

/// Auth key storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeysConfig {
    /// JSON file holding the host's auth keys.
    pub path: PathBuf,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Directory for a daily rolling log file. Logs go to stderr only when unset.
    pub directory: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let options = ClientOptions::default();
        Self {
            debug: options.debug,
            use_checksum: options.use_checksum,
            dump: options.dump,
            key_size: options.key_size,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            push_chunk_size: DEFAULT_PUSH_CHUNK_SIZE,
            push_file_mode: DEFAULT_PUSH_FILE_MODE,
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            path: default_key_file_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("adbshell")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - ADBSHELL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - ADBSHELL_DEBUG: Override the protocol debug flag (true/false/1/0)
    /// - ADBSHELL_PUSH_CHUNK_SIZE: Override the push chunk size in bytes
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("ADBSHELL_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }

        if let Ok(debug) = std::env::var("ADBSHELL_DEBUG") {
            match debug.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.client.debug = true,
                "0" | "false" | "no" => self.client.debug = false,
                "" => {}
                other => tracing::warn!("Ignoring invalid ADBSHELL_DEBUG value: {}", other),
            }
        }

        if let Ok(size) = std::env::var("ADBSHELL_PUSH_CHUNK_SIZE") {
            if !size.is_empty() {
                match size.parse() {
                    Ok(size) => {
                        tracing::info!("Overriding push chunk size from environment: {}", size);
                        self.transfer.push_chunk_size = size;
                    }
                    Err(_) => {
                        tracing::warn!("Ignoring invalid ADBSHELL_PUSH_CHUNK_SIZE value: {}", size)
                    }
                }
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let chunk = self.transfer.push_chunk_size;
        if chunk == 0 || chunk > MAX_PUSH_CHUNK_SIZE {
            return Err(ConfigError::InvalidChunkSize(chunk));
        }

        if self.transfer.push_file_mode > 0o7777 {
            return Err(ConfigError::InvalidFileMode(self.transfer.push_file_mode));
        }

        if !VALID_KEY_SIZES.contains(&self.client.key_size) {
            return Err(ConfigError::InvalidKeySize(self.client.key_size));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Validates the configuration and builds the immutable options handed to
    /// a [`SessionManager`](crate::SessionManager).
    pub fn session_options(&self) -> Result<SessionOptions, ConfigError> {
        self.validate()?;
        Ok(SessionOptions {
            client: ClientOptions {
                debug: self.client.debug,
                use_checksum: self.client.use_checksum,
                dump: self.client.dump,
                key_size: self.client.key_size,
            },
            push_chunk_size: self.transfer.push_chunk_size,
            push_file_mode: self.transfer.push_file_mode,
        })
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
