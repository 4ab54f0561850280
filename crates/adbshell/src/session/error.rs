//! Errors surfaced by the session manager.

use std::path::PathBuf;

use protocol::ProtocolError;
use thiserror::Error;

/// Errors returned by [`SessionManager`](super::SessionManager) operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A Connected-only operation was called outside the Connected state.
    #[error("device is not connected")]
    NotConnected,

    /// connect() was called while a session is already established.
    #[error("a device session is already active")]
    AlreadyConnected,

    /// Opening the transport or the handshake failed.
    #[error("connection failed: {0}")]
    Connection(#[source] ProtocolError),

    /// A push or pull failed on the wire.
    #[error("transfer failed: {0}")]
    Transfer(#[source] ProtocolError),

    /// The device sent a malformed or unexpected response.
    #[error("protocol error: {0}")]
    Protocol(#[source] ProtocolError),

    /// Reading or writing a local file failed.
    #[error("local file error for {path}: {source}")]
    LocalFile {
        /// The local path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    /// Classifies a failed transfer call.
    pub(crate) fn transfer(err: ProtocolError) -> Self {
        if err.is_response_error() {
            SessionError::Protocol(err)
        } else {
            SessionError::Transfer(err)
        }
    }

    /// Classifies a failed control call (reboot, shell writes).
    pub(crate) fn control(err: ProtocolError) -> Self {
        if err.is_response_error() {
            SessionError::Protocol(err)
        } else {
            SessionError::Connection(err)
        }
    }
}

/// Result type alias for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;
