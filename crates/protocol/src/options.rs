//! Options handed to transports and protocol clients.

use serde::{Deserialize, Serialize};

/// Default RSA-equivalent key size requested for new auth keys.
pub const DEFAULT_KEY_SIZE: u32 = 2048;

/// Options consumed by the transport and protocol client collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Log protocol exchanges.
    pub debug: bool,
    /// Compute and verify payload checksums.
    pub use_checksum: bool,
    /// Dump every raw transport packet.
    pub dump: bool,
    /// Size of newly generated auth keys, in bits.
    pub key_size: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            debug: true,
            use_checksum: false,
            dump: false,
            key_size: DEFAULT_KEY_SIZE,
        }
    }
}
