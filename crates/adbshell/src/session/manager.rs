//! Device session lifecycle.
//!
//! A [`SessionManager`] owns at most one live (transport, protocol client,
//! shell) triple. Lifecycle operations (connect, disconnect, reboot,
//! transfers and unplug teardown) run one at a time behind a single async
//! mutex; writes to the shell do not take that lock so a long transfer never
//! blocks interactive input.
//!
//! ```text
//!   Disconnected --connect()--> Connecting --ok--> Connected
//!        ^                          |                  |
//!        +---------- error ---------+                  |
//!        +------- disconnect() / matching unplug ------+
//! ```

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use bytes::Bytes;
use protocol::{ClientOptions, ConnectionInfo};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};

use super::error::{SessionError, SessionResult};
use super::output::{SubscriberRegistry, Subscription};
use super::unplug::DisconnectWatch;
use crate::client::{ClientFactory, OutputSink, ProtocolClient, PushRequest, ShellSession};
use crate::credentials::CredentialStore;
use crate::transfer::{ChunkPlan, DEFAULT_PUSH_CHUNK_SIZE, DEFAULT_PUSH_FILE_MODE};
use crate::transport::{DeviceHandleId, DeviceMonitor, Transport, TransportProvider};

/// Buffer size for the session event channel.
const EVENT_BUFFER_SIZE: usize = 64;

/// Immutable options fixed when the manager is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Options forwarded to every protocol client.
    pub client: ClientOptions,
    /// Bytes per push chunk.
    pub push_chunk_size: usize,
    /// Permission bits for pushed files.
    pub push_file_mode: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client: ClientOptions::default(),
            push_chunk_size: DEFAULT_PUSH_CHUNK_SIZE,
            push_file_mode: DEFAULT_PUSH_FILE_MODE,
        }
    }
}

impl SessionOptions {
    /// Replaces the protocol client options.
    pub fn with_client_options(mut self, client: ClientOptions) -> Self {
        self.client = client;
        self
    }

    /// Sets the push chunk size.
    pub fn with_push_chunk_size(mut self, size: usize) -> Self {
        self.push_chunk_size = size;
        self
    }

    /// Sets the permission bits for pushed files.
    pub fn with_push_file_mode(mut self, mode: u32) -> Self {
        self.push_file_mode = mode;
        self
    }
}

/// Lifecycle state of a [`SessionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No device session.
    Disconnected,
    /// connect() is in progress.
    Connecting,
    /// Transport, client and shell are all live.
    Connected,
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The state changed.
    StateChanged(ConnectionState),
    /// The connected device was physically removed.
    DeviceUnplugged {
        /// Identity of the removed attachment.
        device: DeviceHandleId,
    },
}

/// The external pieces a manager drives.
#[derive(Clone)]
pub struct Collaborators {
    /// Opens transports.
    pub transports: Arc<dyn TransportProvider>,
    /// Reports physical removal.
    pub monitor: Arc<dyn DeviceMonitor>,
    /// Builds protocol clients.
    pub clients: Arc<dyn ClientFactory>,
    /// Stores auth keys.
    pub credentials: Arc<dyn CredentialStore>,
}

/// Resources of a Connected session.
struct ActiveSession {
    transport: Arc<dyn Transport>,
    client: Arc<dyn ProtocolClient>,
    shell: Arc<dyn ShellSession>,
    watch: DisconnectWatch,
}

impl ActiveSession {
    /// Orderly teardown: shell, then transport, then the listener.
    async fn close(mut self) {
        if let Err(e) = self.shell.close().await {
            tracing::warn!("Failed to close shell: {}", e);
        }
        if let Err(e) = self.transport.close().await {
            tracing::warn!("Failed to close transport: {}", e);
        }
        self.watch.deregister();
    }
}

/// Resources acquired so far by an in-progress connect.
struct PendingSession {
    transport: Arc<dyn Transport>,
    watch: DisconnectWatch,
}

impl PendingSession {
    /// Releases everything acquired, newest first.
    async fn rollback(mut self) {
        self.watch.deregister();
        if let Err(e) = self.transport.close().await {
            tracing::warn!("Failed to close transport during rollback: {}", e);
        }
    }
}

/// Lock-free view of the session for accessors and shell writes.
struct Snapshot {
    state: ConnectionState,
    info: Option<ConnectionInfo>,
    shell: Option<Arc<dyn ShellSession>>,
}

struct Inner {
    options: SessionOptions,
    collaborators: Collaborators,
    /// Serializes lifecycle operations and owns the live session.
    session: Mutex<Option<ActiveSession>>,
    snapshot: RwLock<Snapshot>,
    subscribers: SubscriberRegistry,
    events: broadcast::Sender<SessionEvent>,
}

/// Manages the connection to one device.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Creates a manager in the Disconnected state.
    pub fn new(options: SessionOptions, collaborators: Collaborators) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            inner: Arc::new(Inner {
                options,
                collaborators,
                session: Mutex::new(None),
                snapshot: RwLock::new(Snapshot {
                    state: ConnectionState::Disconnected,
                    info: None,
                    shell: None,
                }),
                subscribers: SubscriberRegistry::new(),
                events,
            }),
        }
    }

    /// The options this manager was created with.
    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// Whether the platform can reach devices at all.
    pub fn is_supported(&self) -> bool {
        self.inner.collaborators.transports.is_supported()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.read_snapshot(|s| s.state)
    }

    /// Returns true while Connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Handshake result of the current session.
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.inner.read_snapshot(|s| s.info.clone())
    }

    /// Number of output subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Receives lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Registers a callback for every later unit of shell output.
    ///
    /// Works in any state; the registration survives reconnects.
    pub fn subscribe_output<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.subscribers.subscribe(callback)
    }

    /// Like [`subscribe_output`](Self::subscribe_output), delivering into a channel.
    pub fn subscribe_output_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<String>) {
        self.inner.subscribers.subscribe_channel()
    }

    /// Opens a transport, authenticates and starts an interactive shell.
    ///
    /// Any failure releases everything acquired so far and leaves the
    /// manager Disconnected.
    pub async fn connect(&self) -> SessionResult<ConnectionInfo> {
        let mut session = self.inner.session.lock().await;
        if session.is_some() {
            tracing::warn!("Connect requested while already connected");
            return Err(SessionError::AlreadyConnected);
        }

        self.inner.set_state(ConnectionState::Connecting);

        let (active, info) = match self.inner.establish().await {
            Ok(established) => established,
            Err(e) => {
                tracing::error!("Failed to connect: {}", e);
                self.inner.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let old_state = {
            let mut snapshot = self.inner.write_snapshot();
            snapshot.info = Some(info.clone());
            snapshot.shell = Some(Arc::clone(&active.shell));
            std::mem::replace(&mut snapshot.state, ConnectionState::Connected)
        };
        *session = Some(active);
        self.inner.announce_state(old_state, ConnectionState::Connected);

        tracing::info!(
            serial = ?info.banner.serial,
            model = ?info.banner.model,
            auth = ?info.auth,
            "Connected to device"
        );
        Ok(info)
    }

    /// Tears down the session. A no-op when already Disconnected.
    ///
    /// Close failures are logged, never returned.
    pub async fn disconnect(&self) {
        let mut session = self.inner.session.lock().await;
        let Some(active) = session.take() else {
            tracing::debug!("Disconnect requested with no active session");
            return;
        };

        let old_state = self.inner.reset_snapshot();
        active.close().await;
        self.inner.announce_state(old_state, ConnectionState::Disconnected);
        tracing::info!("Disconnected from device");
    }

    /// Asks the device to reboot. The session stays up until the device drops it.
    pub async fn reboot(&self) -> SessionResult<()> {
        let session = self.inner.session.lock().await;
        let active = session.as_ref().ok_or(SessionError::NotConnected)?;

        tracing::info!("Rebooting device");
        active.client.reboot().await.map_err(SessionError::control)
    }

    /// Writes `command` plus a newline to the shell.
    ///
    /// Without a live shell the command is dropped and `Ok` returned.
    pub async fn send_command(&self, command: &str) -> SessionResult<()> {
        let Some(shell) = self.inner.read_snapshot(|s| s.shell.clone()) else {
            tracing::warn!("Dropping command, shell is not connected");
            return Ok(());
        };

        tracing::debug!(command, "Sending shell command");
        shell
            .write(&format!("{command}\n"))
            .await
            .map_err(SessionError::control)
    }

    /// Reads a whole file from the device.
    pub async fn pull_file(&self, remote_path: &str) -> SessionResult<Bytes> {
        let session = self.inner.session.lock().await;
        let active = session.as_ref().ok_or(SessionError::NotConnected)?;

        let data = active
            .client
            .pull(remote_path)
            .await
            .map_err(SessionError::transfer)?;
        tracing::info!(path = remote_path, bytes = data.len(), "Pulled file");
        Ok(data)
    }

    /// Writes `data` to `remote_path` on the device, chunked and with the
    /// configured permission bits.
    pub async fn push_file(&self, data: impl Into<Bytes>, remote_path: &str) -> SessionResult<()> {
        let session = self.inner.session.lock().await;
        let active = session.as_ref().ok_or(SessionError::NotConnected)?;

        let chunks = ChunkPlan::new(data.into(), self.inner.options.push_chunk_size);
        let total = chunks.total_size();
        let count = chunks.chunk_count();
        let request = PushRequest {
            remote_path: remote_path.to_string(),
            mode: self.inner.options.push_file_mode,
            chunks,
        };

        active
            .client
            .push(request)
            .await
            .map_err(SessionError::transfer)?;
        tracing::info!(path = remote_path, bytes = total, chunks = count, "Pushed file");
        Ok(())
    }

    /// Pushes a local file.
    pub async fn push_local_file(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: &str,
    ) -> SessionResult<()> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }

        let local_path = local_path.as_ref();
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|source| SessionError::LocalFile {
                path: local_path.to_path_buf(),
                source,
            })?;
        self.push_file(data, remote_path).await
    }

    /// Pulls a remote file into a local file, replacing it.
    ///
    /// Returns the number of bytes written.
    pub async fn pull_to_local_file(
        &self,
        remote_path: &str,
        local_path: impl AsRef<Path>,
    ) -> SessionResult<usize> {
        let data = self.pull_file(remote_path).await?;

        let local_path = local_path.as_ref();
        tokio::fs::write(local_path, &data)
            .await
            .map_err(|source| SessionError::LocalFile {
                path: local_path.to_path_buf(),
                source,
            })?;
        Ok(data.len())
    }
}

impl Inner {
    fn read_snapshot<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> T {
        f(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write_snapshot(&self) -> std::sync::RwLockWriteGuard<'_, Snapshot> {
        self.snapshot.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the view to Disconnected and drops info and shell in one step.
    ///
    /// Returns the previous state.
    fn reset_snapshot(&self) -> ConnectionState {
        let mut snapshot = self.write_snapshot();
        snapshot.info = None;
        snapshot.shell = None;
        std::mem::replace(&mut snapshot.state, ConnectionState::Disconnected)
    }

    /// Emits an event to all subscribers.
    fn emit(&self, event: SessionEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.events.send(event);
    }

    /// Sets the state and emits an event if it changed.
    fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut snapshot = self.write_snapshot();
            std::mem::replace(&mut snapshot.state, new_state)
        };
        self.announce_state(old_state, new_state);
    }

    /// Emits `StateChanged` for a transition already applied to the view.
    fn announce_state(&self, old_state: ConnectionState, new_state: ConnectionState) {
        if old_state != new_state {
            tracing::debug!(from = ?old_state, to = ?new_state, "Session state changed");
            self.emit(SessionEvent::StateChanged(new_state));
        }
    }

    fn output_sink(&self) -> OutputSink {
        let subscribers = self.subscribers.clone();
        Arc::new(move |unit: String| {
            tracing::trace!(output = %unit, "Shell output");
            subscribers.dispatch(&unit);
        })
    }

    /// Acquires transport, listener, client and shell in that order.
    ///
    /// On failure the acquired steps are unwound before returning.
    async fn establish(self: &Arc<Self>) -> SessionResult<(ActiveSession, ConnectionInfo)> {
        let transport = self
            .collaborators
            .transports
            .open(&self.options.client)
            .await
            .map_err(SessionError::Connection)?;

        let device = transport.device().id;
        tracing::debug!(%device, serial = ?transport.device().serial, "Opened transport");

        let weak = Arc::downgrade(self);
        let watch = DisconnectWatch::register(
            Arc::clone(&self.collaborators.monitor),
            device,
            move |removed| handle_unplug(weak, removed),
        );
        let pending = PendingSession {
            transport: Arc::clone(&transport),
            watch,
        };

        let client = self.collaborators.clients.create(
            Arc::clone(&transport),
            self.options.client,
            Arc::clone(&self.collaborators.credentials),
        );

        let handshake = async {
            let info = client.connect().await?;
            let shell = client.interactive_shell(self.output_sink()).await?;
            Ok::<_, protocol::ProtocolError>((info, shell))
        };

        match handshake.await {
            Ok((info, shell)) => {
                let PendingSession { transport, watch } = pending;
                let active = ActiveSession {
                    transport,
                    client,
                    shell,
                    watch,
                };
                Ok((active, info))
            }
            Err(e) => {
                pending.rollback().await;
                Err(SessionError::Connection(e))
            }
        }
    }

    /// Tears down a session whose device was removed.
    ///
    /// The transport is already gone, so nothing is closed; resources are
    /// dropped and the listener removed.
    async fn on_unplug(&self, device: DeviceHandleId) {
        let mut session = self.session.lock().await;
        let is_current = session
            .as_ref()
            .is_some_and(|active| active.watch.device() == device);
        if !is_current {
            tracing::debug!(%device, "Ignoring stale unplug event");
            return;
        }
        let Some(mut active) = session.take() else {
            return;
        };

        tracing::warn!(%device, "Device unplugged, setting disconnected");
        let old_state = self.reset_snapshot();
        active.watch.deregister();
        drop(active);

        self.emit(SessionEvent::DeviceUnplugged { device });
        self.announce_state(old_state, ConnectionState::Disconnected);
    }
}

async fn handle_unplug(inner: Weak<Inner>, device: DeviceHandleId) {
    match inner.upgrade() {
        Some(inner) => inner.on_unplug(device).await,
        None => tracing::debug!(%device, "Unplug after session manager was dropped"),
    }
}
