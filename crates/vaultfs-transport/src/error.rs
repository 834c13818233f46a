//! Error types for the transport subsystem.

use thiserror::Error;

use crate::cancel::CancelReason;

/// Errors raised by framing, the RPC client and the connection manager.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer refused the TCP connection.
    #[error("connection refused to {addr}")]
    ConnectionRefused {
        /// Address that was dialed.
        addr: String,
    },

    /// The TCP connect did not complete in time.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Address that was dialed.
        addr: String,
        /// Configured connect timeout.
        timeout_ms: u64,
    },

    /// The connection went away while a call was outstanding.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// A frame could not be parsed.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What was wrong with the frame.
        reason: String,
    },

    /// The frame header did not start with the protocol magic.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// Expected magic.
        expected: u32,
        /// Magic found on the wire.
        got: u32,
    },

    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Our version.
        expected: u8,
        /// Peer version.
        got: u8,
    },

    /// Payload CRC did not match the header.
    #[error("checksum mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        /// CRC carried in the header.
        expected: u32,
        /// CRC computed over the received payload.
        computed: u32,
    },

    /// Payload exceeds the protocol maximum. Retrying cannot help.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Offending payload size.
        size: u64,
        /// Protocol maximum.
        max_size: u32,
    },

    /// No response arrived within the response timeout.
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Request that timed out.
        request_id: u64,
        /// Configured response timeout.
        timeout_ms: u64,
    },

    /// Opcode not known to this protocol version.
    #[error("unknown opcode: 0x{0:04X}")]
    UnknownOpcode(u16),

    /// No usable connection is available.
    #[error("not connected")]
    NotConnected,

    /// The caller's cancel token fired.
    #[error("call canceled: {reason}")]
    Canceled {
        /// Why the token was cancelled.
        reason: CancelReason,
    },

    /// The connection manager was shut down.
    #[error("connection manager shut down")]
    Shutdown,

    /// A collaborator needed to establish the session is temporarily
    /// unreachable.
    #[error("session unavailable: {reason}")]
    SessionUnavailable {
        /// Description of the failure.
        reason: String,
    },

    /// The session could not be authenticated.
    #[error("authentication failed: {reason}")]
    Unauthenticated {
        /// Description of the failure.
        reason: String,
    },

    /// The remote service answered with an application error.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Service-defined status code.
        code: u32,
        /// Human-readable message from the service.
        message: String,
    },

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Underlying socket error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// True when the error means the connection itself is unusable and must
    /// be re-established.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionRefused { .. }
                | TransportError::ConnectionTimeout { .. }
                | TransportError::ConnectionReset
                | TransportError::InvalidFrame { .. }
                | TransportError::InvalidMagic { .. }
                | TransportError::VersionMismatch { .. }
                | TransportError::ChecksumMismatch { .. }
                | TransportError::RequestTimeout { .. }
                | TransportError::NotConnected
                | TransportError::SessionUnavailable { .. }
                | TransportError::IoError(_)
        )
    }

    /// Returns the remote status code for application errors.
    pub fn remote_code(&self) -> Option<u32> {
        match self {
            TransportError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors_classified() {
        assert!(TransportError::ConnectionReset.is_connection_error());
        assert!(TransportError::NotConnected.is_connection_error());
        assert!(TransportError::RequestTimeout {
            request_id: 1,
            timeout_ms: 10
        }
        .is_connection_error());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(TransportError::from(io).is_connection_error());
        assert!(TransportError::SessionUnavailable {
            reason: "identity service down".into()
        }
        .is_connection_error());
    }

    #[test]
    fn test_application_errors_not_connection_level() {
        let remote = TransportError::Remote {
            code: 4,
            message: "slow down".into(),
        };
        assert!(!remote.is_connection_error());
        assert_eq!(remote.remote_code(), Some(4));
        assert!(!TransportError::Canceled {
            reason: CancelReason::UserRequested
        }
        .is_connection_error());
        assert!(!TransportError::Shutdown.is_connection_error());
        assert!(!TransportError::PayloadTooLarge {
            size: 1 << 30,
            max_size: 1 << 26
        }
        .is_connection_error());
        assert!(!TransportError::Unauthenticated {
            reason: "x".into()
        }
        .is_connection_error());
    }

    #[test]
    fn test_display_messages() {
        let err = TransportError::InvalidMagic {
            expected: 0x5646_5301,
            got: 0,
        };
        assert_eq!(
            err.to_string(),
            "invalid magic number: expected 0x56465301, got 0x00000000"
        );
        let err = TransportError::Remote {
            code: 1,
            message: "no such block".into(),
        };
        assert_eq!(err.to_string(), "remote error 1: no such block");
    }
}
