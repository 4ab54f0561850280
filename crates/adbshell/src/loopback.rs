//! In-process device.
//!
//! [`LoopbackDevice`] plays every collaborator role at once: transport
//! provider, device monitor, client factory and the device itself. It keeps
//! a remote file table, answers shell commands from a response table, runs
//! the key-based auth exchange against a [`CredentialStore`] and can be
//! unplugged and re-attached at will. Counters, one-shot failure points and
//! stall points make it suitable for exercising a [`SessionManager`](crate::SessionManager)
//! without hardware.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use protocol::{
    AuthKeyPair, AuthOutcome, AuthPublicKey, ClientOptions, ConnectionInfo, DeviceBanner,
    ProtocolError, Result, AUTH_TOKEN_LENGTH, MAX_PAYLOAD, PROTOCOL_VERSION,
};
use tokio::sync::Notify;

use crate::client::{ClientFactory, OutputSink, ProtocolClient, PushRequest, ShellSession};
use crate::credentials::CredentialStore;
use crate::session::Collaborators;
use crate::transport::{
    DeviceDescriptor, DeviceHandleId, DeviceMonitor, DisconnectCallback, ListenerId, Transport,
    TransportProvider,
};

const REPLY_OKAY: &[u8] = b"OKAY";

/// How the device treats host keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPolicy {
    /// Accepts every host without a key exchange.
    NotRequired,
    /// Accepts authorized keys and authorizes new ones, as if the user tapped "Allow".
    AcceptNewKeys,
    /// Accepts authorized keys only.
    AuthorizedOnly,
}

/// One-shot failure points. Each armed point fires once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// Device selection fails.
    Open,
    /// The device does not answer the connect packet.
    Handshake,
    /// The device refuses the shell stream.
    Shell,
    /// The next reply from the device is garbage.
    GarbledReply,
    /// The next pull is interrupted.
    Pull,
    /// The next push is interrupted.
    Push,
    /// The next reboot request is lost.
    Reboot,
    /// Closing the shell fails.
    CloseShell,
    /// Closing the transport fails.
    CloseTransport,
}

/// Places where the device can be held mid-operation. Each armed point fires once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StallPoint {
    /// Before the device answers the connect packet.
    Handshake,
    /// After each chunk of a push is acknowledged.
    PushChunk,
    /// Inside transport close.
    TransportClose,
}

#[derive(Default)]
struct StallGate {
    reached: Notify,
    release: Notify,
}

/// Handle to an armed [`StallPoint`].
#[derive(Clone)]
pub struct Stall {
    gate: Arc<StallGate>,
}

impl Stall {
    /// Waits until the device is held at the stall point.
    pub async fn reached(&self) {
        self.gate.reached.notified().await;
    }

    /// Lets the held operation continue.
    pub fn release(&self) {
        self.gate.release.notify_one();
    }
}

/// A chunk written by a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkWrite {
    /// Destination path.
    pub remote_path: String,
    /// Bytes in this chunk.
    pub len: usize,
    /// Requested permission bits.
    pub mode: u32,
}

#[derive(Debug, Clone)]
struct RemoteFile {
    data: Bytes,
    mode: u32,
}

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    transport_writes: AtomicUsize,
    transport_reads: AtomicUsize,
    transport_closes: AtomicUsize,
    shells_opened: AtomicUsize,
    shell_closes: AtomicUsize,
    reboots: AtomicUsize,
}

struct DeviceState {
    serial: String,
    banner: String,
    policy: AuthPolicy,
    supported: AtomicBool,
    attached: Mutex<Option<DeviceHandleId>>,
    authorized: Mutex<HashSet<AuthPublicKey>>,
    files: Mutex<HashMap<String, RemoteFile>>,
    responses: Mutex<HashMap<String, String>>,
    push_log: Mutex<Vec<ChunkWrite>>,
    shell_input: Mutex<Vec<String>>,
    shell_sink: Mutex<Option<OutputSink>>,
    listeners: Mutex<BTreeMap<u64, DisconnectCallback>>,
    next_listener: AtomicU64,
    failures: Mutex<HashSet<FailPoint>>,
    stalls: Mutex<HashMap<StallPoint, Arc<StallGate>>>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeviceState {
    fn take_failure(&self, point: FailPoint) -> bool {
        lock(&self.failures).remove(&point)
    }

    /// Holds the caller at `point` if it is armed, until released.
    async fn pause_at(&self, point: StallPoint) {
        let gate = lock(&self.stalls).remove(&point);
        if let Some(gate) = gate {
            tracing::debug!(?point, "Loopback device stalled");
            gate.reached.notify_one();
            gate.release.notified().await;
        }
    }

    fn is_attached(&self, id: DeviceHandleId) -> bool {
        *lock(&self.attached) == Some(id)
    }

    /// Answers one packet from the host.
    fn reply(&self) -> Bytes {
        if self.take_failure(FailPoint::GarbledReply) {
            Bytes::from_static(b"\x00\x17garbage")
        } else {
            Bytes::from_static(REPLY_OKAY)
        }
    }

    fn fire_removal(&self, id: DeviceHandleId) -> usize {
        let callbacks: Vec<DisconnectCallback> = lock(&self.listeners).values().cloned().collect();
        for callback in &callbacks {
            callback(id);
        }
        callbacks.len()
    }
}

/// A simulated device. Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct LoopbackDevice {
    state: Arc<DeviceState>,
}

impl LoopbackDevice {
    /// Creates an attached device that accepts new keys.
    pub fn new(serial: impl Into<String>) -> Self {
        Self::with_policy(serial, AuthPolicy::AcceptNewKeys)
    }

    /// Creates an attached device with the given auth policy.
    pub fn with_policy(serial: impl Into<String>, policy: AuthPolicy) -> Self {
        let serial = serial.into();
        let banner = format!(
            "device:{serial}:ro.product.name=sdk_phone64;ro.product.model=Loopback;ro.product.device=loopback;features=shell_v2,cmd,stat_v2"
        );
        Self {
            state: Arc::new(DeviceState {
                serial,
                banner,
                policy,
                supported: AtomicBool::new(true),
                attached: Mutex::new(Some(DeviceHandleId::new())),
                authorized: Mutex::new(HashSet::new()),
                files: Mutex::new(HashMap::new()),
                responses: Mutex::new(HashMap::new()),
                push_log: Mutex::new(Vec::new()),
                shell_input: Mutex::new(Vec::new()),
                shell_sink: Mutex::new(None),
                listeners: Mutex::new(BTreeMap::new()),
                next_listener: AtomicU64::new(0),
                failures: Mutex::new(HashSet::new()),
                stalls: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Bundles this device as the collaborators of a session manager.
    pub fn collaborators(&self, credentials: Arc<dyn CredentialStore>) -> Collaborators {
        Collaborators {
            transports: Arc::new(self.clone()),
            monitor: Arc::new(self.clone()),
            clients: Arc::new(self.clone()),
            credentials,
        }
    }

    /// The device serial.
    pub fn serial(&self) -> &str {
        &self.state.serial
    }

    /// Makes the platform report (no) device support.
    pub fn set_supported(&self, supported: bool) {
        self.state.supported.store(supported, Ordering::SeqCst);
    }

    /// Arms a one-shot failure.
    pub fn fail_next(&self, point: FailPoint) {
        lock(&self.state.failures).insert(point);
    }

    /// Arms a one-shot stall and returns its handle.
    pub fn stall_next(&self, point: StallPoint) -> Stall {
        let gate = Arc::new(StallGate::default());
        lock(&self.state.stalls).insert(point, Arc::clone(&gate));
        Stall { gate }
    }

    /// Marks a host key as authorized, as if accepted earlier.
    pub fn authorize_key(&self, key: AuthPublicKey) {
        lock(&self.state.authorized).insert(key);
    }

    /// Number of authorized host keys.
    pub fn authorized_key_count(&self) -> usize {
        lock(&self.state.authorized).len()
    }

    /// Identity of the current attachment, if plugged in.
    pub fn current_id(&self) -> Option<DeviceHandleId> {
        *lock(&self.state.attached)
    }

    /// Physically removes the device and notifies every listener.
    ///
    /// Returns the identity of the removed attachment.
    pub fn unplug(&self) -> Option<DeviceHandleId> {
        let id = lock(&self.state.attached).take()?;
        lock(&self.state.shell_sink).take();
        let notified = self.state.fire_removal(id);
        tracing::debug!(%id, notified, "Loopback device unplugged");
        Some(id)
    }

    /// Re-attaches the device under a fresh identity.
    pub fn replug(&self) -> DeviceHandleId {
        let id = DeviceHandleId::new();
        *lock(&self.state.attached) = Some(id);
        id
    }

    /// Reports removal of some device to every listener without detaching this one.
    pub fn emit_removal(&self, id: DeviceHandleId) -> usize {
        self.state.fire_removal(id)
    }

    /// Number of registered disconnect listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.state.listeners).len()
    }

    /// Makes the shell answer `command` with `output`.
    pub fn respond_to(&self, command: impl Into<String>, output: impl Into<String>) {
        lock(&self.state.responses).insert(command.into(), output.into());
    }

    /// Pushes one unit of output through the open shell.
    ///
    /// Returns false when no shell is open.
    pub fn emit_shell_output(&self, unit: impl Into<String>) -> bool {
        let sink = lock(&self.state.shell_sink).clone();
        match sink {
            Some(sink) => {
                sink(unit.into());
                true
            }
            None => false,
        }
    }

    /// Everything written to the shell so far.
    pub fn shell_input(&self) -> Vec<String> {
        lock(&self.state.shell_input).clone()
    }

    /// Places a file on the device.
    pub fn put_remote_file(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        lock(&self.state.files).insert(
            path.into(),
            RemoteFile {
                data: data.into(),
                mode: 0o644,
            },
        );
    }

    /// Contents of a file on the device.
    pub fn remote_file(&self, path: &str) -> Option<Bytes> {
        lock(&self.state.files).get(path).map(|f| f.data.clone())
    }

    /// Permission bits of a file on the device.
    pub fn remote_file_mode(&self, path: &str) -> Option<u32> {
        lock(&self.state.files).get(path).map(|f| f.mode)
    }

    /// Every chunk received by pushes, in order.
    pub fn push_writes(&self) -> Vec<ChunkWrite> {
        lock(&self.state.push_log).clone()
    }

    /// Transport reads plus writes.
    pub fn io_count(&self) -> usize {
        let counters = &self.state.counters;
        counters.transport_writes.load(Ordering::SeqCst) + counters.transport_reads.load(Ordering::SeqCst)
    }

    /// Number of transports opened.
    pub fn open_count(&self) -> usize {
        self.state.counters.opens.load(Ordering::SeqCst)
    }

    /// Number of transport close calls.
    pub fn transport_close_count(&self) -> usize {
        self.state.counters.transport_closes.load(Ordering::SeqCst)
    }

    /// Number of shells opened.
    pub fn shell_open_count(&self) -> usize {
        self.state.counters.shells_opened.load(Ordering::SeqCst)
    }

    /// Number of shell close calls.
    pub fn shell_close_count(&self) -> usize {
        self.state.counters.shell_closes.load(Ordering::SeqCst)
    }

    /// Number of reboots requested.
    pub fn reboot_count(&self) -> usize {
        self.state.counters.reboots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportProvider for LoopbackDevice {
    fn is_supported(&self) -> bool {
        self.state.supported.load(Ordering::SeqCst)
    }

    async fn open(&self, options: &ClientOptions) -> Result<Arc<dyn Transport>> {
        if !self.is_supported() {
            return Err(ProtocolError::DeviceUnavailable(
                "device access is not supported on this platform".into(),
            ));
        }
        if self.state.take_failure(FailPoint::Open) {
            return Err(ProtocolError::DeviceUnavailable("no device selected".into()));
        }
        let id = self
            .current_id()
            .ok_or_else(|| ProtocolError::DeviceUnavailable("no device attached".into()))?;

        self.state.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackTransport {
            descriptor: DeviceDescriptor {
                id,
                serial: Some(self.state.serial.clone()),
                product_name: Some("Loopback".into()),
            },
            state: Arc::clone(&self.state),
            dump: options.dump,
            inbound: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

impl DeviceMonitor for LoopbackDevice {
    fn add_disconnect_listener(&self, callback: DisconnectCallback) -> ListenerId {
        let id = self.state.next_listener.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.listeners).insert(id, callback);
        ListenerId(id)
    }

    fn remove_disconnect_listener(&self, id: ListenerId) -> bool {
        lock(&self.state.listeners).remove(&id.0).is_some()
    }
}

impl ClientFactory for LoopbackDevice {
    fn create(
        &self,
        transport: Arc<dyn Transport>,
        options: ClientOptions,
        credentials: Arc<dyn CredentialStore>,
    ) -> Arc<dyn ProtocolClient> {
        Arc::new(LoopbackClient {
            transport,
            options,
            credentials,
            state: Arc::clone(&self.state),
        })
    }
}

struct LoopbackTransport {
    descriptor: DeviceDescriptor,
    state: Arc<DeviceState>,
    dump: bool,
    /// Replies waiting to be read.
    inbound: Mutex<VecDeque<Bytes>>,
    closed: AtomicBool,
}

impl LoopbackTransport {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::ConnectionClosed("transport is closed".into()));
        }
        if !self.state.is_attached(self.descriptor.id) {
            return Err(ProtocolError::ConnectionClosed("device was disconnected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn device(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        self.state.counters.transport_writes.fetch_add(1, Ordering::SeqCst);
        if self.dump {
            tracing::debug!(len = data.len(), data = %hex::encode(data), "OUT");
        }
        let reply = self.state.reply();
        lock(&self.inbound).push_back(reply);
        Ok(())
    }

    async fn read(&self, max_len: usize) -> Result<Bytes> {
        self.check_open()?;
        self.state.counters.transport_reads.fetch_add(1, Ordering::SeqCst);
        let mut inbound = lock(&self.inbound);
        let mut reply = inbound
            .pop_front()
            .ok_or_else(|| ProtocolError::Timeout("no data from device".into()))?;
        if reply.len() > max_len {
            let rest = reply.split_off(max_len);
            inbound.push_front(rest);
        }
        if self.dump {
            tracing::debug!(len = reply.len(), data = %hex::encode(&reply), "IN");
        }
        Ok(reply)
    }

    async fn close(&self) -> Result<()> {
        self.state.pause_at(StallPoint::TransportClose).await;
        self.state.counters.transport_closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        if self.state.take_failure(FailPoint::CloseTransport) {
            return Err(ProtocolError::ConnectionClosed("release interface failed".into()));
        }
        Ok(())
    }
}

struct LoopbackClient {
    transport: Arc<dyn Transport>,
    options: ClientOptions,
    credentials: Arc<dyn CredentialStore>,
    state: Arc<DeviceState>,
}

impl LoopbackClient {
    /// Sends one packet and expects an acknowledgement.
    async fn exchange(&self, packet: &[u8]) -> Result<()> {
        if self.options.debug {
            tracing::debug!(packet = %String::from_utf8_lossy(packet), "Sending packet");
        }
        self.transport.write(packet).await?;
        let reply = self.transport.read(MAX_PAYLOAD as usize).await?;
        if reply.as_ref() != REPLY_OKAY {
            return Err(ProtocolError::UnexpectedResponse {
                expected: String::from_utf8_lossy(REPLY_OKAY).into_owned(),
                got: String::from_utf8_lossy(&reply).into_owned(),
            });
        }
        Ok(())
    }

    /// Offers stored keys, then a fresh one.
    async fn authenticate(&self) -> Result<AuthOutcome> {
        if self.state.policy == AuthPolicy::NotRequired {
            return Ok(AuthOutcome::NotRequired);
        }

        let token: [u8; AUTH_TOKEN_LENGTH] = rand::random();

        for key in self.credentials.load_keys().await? {
            let signature = key.sign(&token);
            self.exchange(b"AUTH signature").await?;
            let public_key = key.public_key();
            let accepted = lock(&self.state.authorized).contains(&public_key)
                && public_key.verify(&token, &signature).is_ok();
            if accepted {
                tracing::debug!(fingerprint = %key.fingerprint(), "Device accepted stored key");
                return Ok(AuthOutcome::StoredKey);
            }
        }

        tracing::debug!(key_size = self.options.key_size, "Generating new auth key");
        let key = AuthKeyPair::generate(format!("adbshell@{}", self.state.serial));
        self.credentials.save_key(&key).await?;
        self.exchange(b"AUTH publickey").await?;

        match self.state.policy {
            AuthPolicy::AcceptNewKeys => {
                lock(&self.state.authorized).insert(key.public_key());
                tracing::info!(fingerprint = %key.fingerprint(), "Device accepted new key");
                Ok(AuthOutcome::NewKey)
            }
            _ => Err(ProtocolError::AuthRejected(format!(
                "device did not accept key {}",
                key.fingerprint()
            ))),
        }
    }
}

#[async_trait]
impl ProtocolClient for LoopbackClient {
    async fn connect(&self) -> Result<ConnectionInfo> {
        self.state.pause_at(StallPoint::Handshake).await;
        if self.state.take_failure(FailPoint::Handshake) {
            return Err(ProtocolError::HandshakeFailed(
                "device did not answer the connect packet".into(),
            ));
        }
        let connect = format!(
            "CNXN {PROTOCOL_VERSION:#010x} {MAX_PAYLOAD} checksum={}",
            self.options.use_checksum
        );
        self.exchange(connect.as_bytes()).await?;

        let auth = self.authenticate().await?;
        let banner = DeviceBanner::parse(&self.state.banner)?;

        Ok(ConnectionInfo {
            banner,
            protocol_version: PROTOCOL_VERSION,
            max_payload: MAX_PAYLOAD,
            auth,
        })
    }

    async fn interactive_shell(&self, sink: OutputSink) -> Result<Arc<dyn ShellSession>> {
        if self.state.take_failure(FailPoint::Shell) {
            return Err(ProtocolError::ConnectionClosed("device refused the shell stream".into()));
        }
        self.exchange(b"OPEN shell:").await?;

        *lock(&self.state.shell_sink) = Some(sink);
        self.state.counters.shells_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackShell {
            transport: Arc::clone(&self.transport),
            state: Arc::clone(&self.state),
        }))
    }

    async fn reboot(&self) -> Result<()> {
        if self.state.take_failure(FailPoint::Reboot) {
            return Err(ProtocolError::ConnectionClosed("reboot request was lost".into()));
        }
        self.exchange(b"OPEN reboot:").await?;
        self.state.counters.reboots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn pull(&self, remote_path: &str) -> Result<Bytes> {
        self.exchange(format!("RECV {remote_path}").as_bytes()).await?;
        if self.state.take_failure(FailPoint::Pull) {
            return Err(ProtocolError::TransferFailed("pull interrupted".into()));
        }

        lock(&self.state.files)
            .get(remote_path)
            .map(|file| file.data.clone())
            .ok_or_else(|| ProtocolError::RemoteFailure {
                path: remote_path.to_string(),
                reason: "No such file or directory".into(),
            })
    }

    async fn push(&self, request: PushRequest) -> Result<()> {
        let PushRequest {
            remote_path,
            mode,
            chunks,
        } = request;

        self.exchange(format!("SEND {remote_path},{mode:o}").as_bytes())
            .await?;
        if self.state.take_failure(FailPoint::Push) {
            return Err(ProtocolError::TransferFailed("push interrupted".into()));
        }

        for chunk in chunks.chunks() {
            self.exchange(&chunk).await?;
            lock(&self.state.push_log).push(ChunkWrite {
                remote_path: remote_path.clone(),
                len: chunk.len(),
                mode,
            });
            self.state.pause_at(StallPoint::PushChunk).await;
        }
        self.exchange(b"DONE").await?;

        lock(&self.state.files).insert(
            remote_path,
            RemoteFile {
                data: chunks.data().clone(),
                mode,
            },
        );
        Ok(())
    }
}

struct LoopbackShell {
    transport: Arc<dyn Transport>,
    state: Arc<DeviceState>,
}

#[async_trait]
impl ShellSession for LoopbackShell {
    async fn write(&self, data: &str) -> Result<()> {
        self.transport.write(data.as_bytes()).await?;
        self.transport.read(MAX_PAYLOAD as usize).await?;
        lock(&self.state.shell_input).push(data.to_string());

        let response = lock(&self.state.responses)
            .get(data.trim_end_matches('\n'))
            .cloned();
        if let Some(output) = response {
            let sink = lock(&self.state.shell_sink).clone();
            if let Some(sink) = sink {
                sink(output);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.counters.shell_closes.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.shell_sink).take();
        if self.state.take_failure(FailPoint::CloseShell) {
            return Err(ProtocolError::ConnectionClosed("shell stream already closed".into()));
        }
        Ok(())
    }
}
