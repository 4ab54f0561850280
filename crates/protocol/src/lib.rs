//! # adbshell Protocol Library
//!
//! Shared vocabulary between the session manager and the device-side
//! collaborators (transport, protocol client, credential store).
//!
//! ## Overview
//!
//! - **Connection Info**: device banner parsing and negotiated handshake results
//! - **Auth Keys**: Ed25519 host keys, token signing and fingerprints
//! - **Client Options**: debug/checksum/dump flags and key size
//! - **Errors**: the failure taxonomy reported by collaborators
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{AuthKeyPair, DeviceBanner};
//!
//! let key = AuthKeyPair::generate("user@host");
//! let signature = key.sign(b"device token");
//! assert!(key.public_key().verify(b"device token", &signature).is_ok());
//!
//! let banner = DeviceBanner::parse("device::ro.product.model=Pixel;features=shell_v2").unwrap();
//! assert_eq!(banner.model.as_deref(), Some("Pixel"));
//! ```
//!
//! ## Modules
//!
//! - [`info`]: Connection information and device banners
//! - [`keys`]: Authentication key pairs
//! - [`options`]: Client options
//! - [`error`]: Error types

pub mod error;
pub mod info;
pub mod keys;
pub mod options;

pub use error::{ProtocolError, Result};
pub use info::{AuthOutcome, ConnectionInfo, DeviceBanner, MAX_PAYLOAD, PROTOCOL_VERSION};
pub use keys::{AuthKeyPair, AuthPublicKey, AuthSignature, AUTH_TOKEN_LENGTH, KEY_FINGERPRINT_LENGTH};
pub use options::{ClientOptions, DEFAULT_KEY_SIZE};
