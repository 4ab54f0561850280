//! Protocol client collaborator contracts.
//!
//! A [`ProtocolClient`] speaks the device protocol over an open
//! [`Transport`]: it runs the connect/auth handshake, opens shell streams and
//! drives the sync sub-protocol for file transfer. The packet codec behind it
//! is not part of this crate.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use protocol::{ClientOptions, ConnectionInfo, Result};

use crate::credentials::CredentialStore;
use crate::transfer::ChunkPlan;
use crate::transport::Transport;

/// Receives every unit of output a shell stream produces, in order.
pub type OutputSink = Arc<dyn Fn(String) + Send + Sync>;

/// A request to write a file on the device.
#[derive(Debug, Clone)]
pub struct PushRequest {
    /// Destination path on the device.
    pub remote_path: String,
    /// Unix permission bits for the created file.
    pub mode: u32,
    /// The payload, already segmented into chunks.
    pub chunks: ChunkPlan,
}

/// An interactive shell stream on an authenticated connection.
#[async_trait]
pub trait ShellSession: Send + Sync {
    /// Writes input to the shell.
    async fn write(&self, data: &str) -> Result<()>;

    /// Closes the shell stream.
    async fn close(&self) -> Result<()>;
}

/// High-level protocol operations on top of a transport.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Runs the version/auth handshake.
    ///
    /// Keys come from the credential store the client was created with; a
    /// newly generated key is saved back to it before it is offered.
    async fn connect(&self) -> Result<ConnectionInfo>;

    /// Opens an interactive shell whose output is pushed into `sink`.
    async fn interactive_shell(&self, sink: OutputSink) -> Result<Arc<dyn ShellSession>>;

    /// Asks the device to reboot.
    async fn reboot(&self) -> Result<()>;

    /// Reads a whole file from the device.
    async fn pull(&self, remote_path: &str) -> Result<Bytes>;

    /// Writes a file to the device chunk by chunk.
    async fn push(&self, request: PushRequest) -> Result<()>;
}

/// Builds protocol clients over freshly opened transports.
pub trait ClientFactory: Send + Sync {
    /// Creates a client. No I/O happens until [`ProtocolClient::connect`].
    fn create(
        &self,
        transport: Arc<dyn Transport>,
        options: ClientOptions,
        credentials: Arc<dyn CredentialStore>,
    ) -> Arc<dyn ProtocolClient>;
}
