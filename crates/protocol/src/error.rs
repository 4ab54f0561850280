//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering failures reported by device-side collaborators.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Key material errors
    /// Signature verification failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Invalid or malformed key material.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The credential store could not load or persist keys.
    #[error("key store error: {0}")]
    KeyStore(String),

    // Transport errors
    /// No device could be opened on the transport.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    // Handshake errors
    /// Version negotiation or the connect exchange failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The device refused every offered key.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    // Device response errors
    /// The device answered with a command the exchange did not expect.
    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse {
        /// Command the exchange was waiting for.
        expected: String,
        /// Command actually received.
        got: String,
    },

    /// The device answered with bytes that could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    // Transfer errors
    /// The device reported a failure for a remote path.
    #[error("remote failure for {path}: {reason}")]
    RemoteFailure {
        /// Remote path the request named.
        path: String,
        /// Reason string sent by the device.
        reason: String,
    },

    /// File or data transfer failed.
    #[error("transfer failed: {0}")]
    TransferFailed(String),
}

impl ProtocolError {
    /// Returns true when the error comes from a malformed or unexpected device reply.
    pub fn is_response_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnexpectedResponse { .. }
                | ProtocolError::MalformedResponse(_)
                | ProtocolError::Deserialization(_)
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<ed25519_dalek::SignatureError> for ProtocolError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        ProtocolError::InvalidSignature(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            ErrorKind::NotFound => ProtocolError::DeviceUnavailable(err.to_string()),
            _ => ProtocolError::TransferFailed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_failed_error_display() {
        let err = ProtocolError::HandshakeFailed("version mismatch".to_string());
        assert_eq!(err.to_string(), "handshake failed: version mismatch");
    }

    #[test]
    fn test_auth_rejected_error_display() {
        let err = ProtocolError::AuthRejected("no key accepted".to_string());
        assert_eq!(err.to_string(), "authentication rejected: no key accepted");
    }

    #[test]
    fn test_unexpected_response_error_display() {
        let err = ProtocolError::UnexpectedResponse {
            expected: "OKAY".to_string(),
            got: "FAIL".to_string(),
        };
        assert_eq!(err.to_string(), "unexpected response: expected OKAY, got FAIL");
    }

    #[test]
    fn test_remote_failure_error_display() {
        let err = ProtocolError::RemoteFailure {
            path: "/sdcard/missing.txt".to_string(),
            reason: "No such file or directory".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "remote failure for /sdcard/missing.txt: No such file or directory"
        );
    }

    #[test]
    fn test_connection_closed_error_display() {
        let err = ProtocolError::ConnectionClosed("device detached".to_string());
        assert_eq!(err.to_string(), "connection closed: device detached");
    }

    #[test]
    fn test_key_store_error_display() {
        let err = ProtocolError::KeyStore("permission denied".to_string());
        assert_eq!(err.to_string(), "key store error: permission denied");
    }

    #[test]
    fn test_is_response_error() {
        assert!(ProtocolError::MalformedResponse("short read".into()).is_response_error());
        assert!(ProtocolError::UnexpectedResponse {
            expected: "DATA".into(),
            got: "QUIT".into(),
        }
        .is_response_error());
        assert!(!ProtocolError::TransferFailed("write failed".into()).is_response_error());
        assert!(!ProtocolError::ConnectionClosed("gone".into()).is_response_error());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let protocol_err: ProtocolError = json_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_io_error_timeout() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Timeout(_)));
    }

    #[test]
    fn test_from_io_error_connection_closed() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::ConnectionClosed(_)));
    }

    #[test]
    fn test_from_io_error_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no device");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::DeviceUnavailable(_)));
    }

    #[test]
    fn test_from_io_error_other() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::TransferFailed(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
