//! # adbshell Session Library
//!
//! This crate manages the connection between a host and one debuggable
//! device: it connects and authenticates, keeps an interactive shell open,
//! moves files in both directions and recovers cleanly when the device is
//! pulled out.
//!
//! ## Overview
//!
//! - **Session Manager**: connect with rollback, disconnect, reboot, shell commands
//! - **Output Fan-out**: every unit of shell output reaches every subscriber, in order
//! - **Unplug Handling**: removal of the connected device tears the session down
//! - **File Transfer**: chunked push with configurable permission bits, whole-file pull
//! - **Credentials**: auth keys persisted between runs
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    SessionManager                       │
//! │   op lock ── state snapshot ── output subscribers       │
//! ├──────────────┬──────────────┬──────────────┬────────────┤
//! │  Transport   │   Device     │   Protocol   │ Credential │
//! │  Provider    │   Monitor    │   Client     │   Store    │
//! └──────────────┴──────────────┴──────────────┴────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use adbshell::{FileCredentialStore, LoopbackDevice, SessionManager, SessionOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let device = LoopbackDevice::new("emulator-5554");
//!     device.respond_to("ls", "a.txt\n");
//!
//!     let credentials = Arc::new(FileCredentialStore::with_default_path());
//!     let manager = SessionManager::new(SessionOptions::default(), device.collaborators(credentials));
//!
//!     let _subscription = manager.subscribe_output(|unit| print!("{unit}"));
//!     manager.connect().await?;
//!     manager.send_command("ls").await?;
//!     manager.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Session lifecycle and output subscribers
//! - [`transport`]: Transport and device monitor contracts
//! - [`client`]: Protocol client contracts
//! - [`credentials`]: Key storage
//! - [`transfer`]: Push chunking
//! - [`config`]: Configuration loading and defaults
//! - [`logging`]: Tracing setup
//! - [`loopback`]: In-process device

pub mod client;
pub mod config;
pub mod credentials;
pub mod logging;
pub mod loopback;
pub mod session;
pub mod transfer;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{
    Collaborators, ConnectionState, SessionError, SessionEvent, SessionManager, SessionOptions,
    SessionResult, SubscriberRegistry, Subscription,
};

// Re-export collaborator contracts for convenience
pub use client::{ClientFactory, OutputSink, ProtocolClient, PushRequest, ShellSession};
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use transfer::ChunkPlan;
pub use transport::{
    DeviceDescriptor, DeviceHandleId, DeviceMonitor, DisconnectCallback, ListenerId, Transport,
    TransportProvider,
};

// Re-export loopback types for convenience
pub use loopback::{AuthPolicy, ChunkWrite, FailPoint, LoopbackDevice, Stall, StallPoint};
