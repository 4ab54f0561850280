//! Transport collaborator contracts.
//!
//! A [`TransportProvider`] opens the physical link to a device (USB in the
//! browser build, anything byte-oriented elsewhere). The packet codec lives
//! above the transport, inside the [`ProtocolClient`](crate::client::ProtocolClient).
//!
//! Physical removal is reported through a [`DeviceMonitor`], the platform's
//! device notification hub. Listeners receive the [`DeviceHandleId`] of the
//! removed device and must filter by identity themselves.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use protocol::{ClientOptions, Result};
use uuid::Uuid;

/// Opaque identity of one attachment of a physical device.
///
/// The platform hands out a fresh id every time a device is plugged in, so an
/// id captured at connect time never matches a later re-attachment of the
/// same hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandleId(Uuid);

impl DeviceHandleId {
    /// Allocates a new, never before seen identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeviceHandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeviceHandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static description of an attached device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Identity of this attachment.
    pub id: DeviceHandleId,
    /// USB serial number or equivalent.
    pub serial: Option<String>,
    /// Product name reported by the device.
    pub product_name: Option<String>,
}

/// An open physical connection to one device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Describes the device this transport is bound to.
    fn device(&self) -> &DeviceDescriptor;

    /// Writes raw bytes to the device.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Reads up to `max_len` raw bytes from the device.
    async fn read(&self, max_len: usize) -> Result<Bytes>;

    /// Releases the physical connection.
    async fn close(&self) -> Result<()>;
}

/// Opens transports to devices.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Returns whether the platform can reach devices at all.
    fn is_supported(&self) -> bool;

    /// Selects a device and opens a transport to it.
    async fn open(&self, options: &ClientOptions) -> Result<Arc<dyn Transport>>;
}

/// Callback invoked with the identity of a physically removed device.
pub type DisconnectCallback = Arc<dyn Fn(DeviceHandleId) + Send + Sync>;

/// Token for a registered disconnect listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Platform notification hub for device removal.
///
/// Implementations must invoke callbacks without holding any lock that
/// [`remove_disconnect_listener`](DeviceMonitor::remove_disconnect_listener)
/// takes, so a listener may deregister itself from inside its own callback.
pub trait DeviceMonitor: Send + Sync {
    /// Registers a listener for device removal events.
    fn add_disconnect_listener(&self, callback: DisconnectCallback) -> ListenerId;

    /// Removes a listener. Returns false if it was not registered.
    fn remove_disconnect_listener(&self, id: ListenerId) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_handle_ids_are_unique() {
        let a = DeviceHandleId::new();
        let b = DeviceHandleId::new();
        assert_ne!(a, b);
        assert_eq!(a, a);
    }

    #[test]
    fn test_device_handle_id_display() {
        let id = DeviceHandleId::new();
        assert_eq!(id.to_string().len(), 36);
    }
}
