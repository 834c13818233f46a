//! Error types for the block server subsystem.

use thiserror::Error;
use vaultfs_transport::TransportError;

use crate::block::BlockId;
use crate::wire::StatusCode;

/// Result type alias for block server operations.
pub type BlockServerResult<T> = Result<T, BlockServerError>;

/// Error variants surfaced by every block server variant.
#[derive(Debug, Error)]
pub enum BlockServerError {
    /// No live reference exists for the block.
    #[error("block not found: {id}")]
    NotFound {
        /// The block that was requested.
        id: BlockId,
    },

    /// The caller is not allowed to perform the operation.
    #[error("permission denied: {reason}")]
    PermissionDenied {
        /// Description from the server or session layer.
        reason: String,
    },

    /// The write would push the charged user over quota.
    #[error("quota exceeded for {user}: {used} of {limit} bytes used")]
    QuotaExceeded {
        /// The user charged for the write.
        user: String,
        /// Bytes charged to the user before the write.
        used: u64,
        /// The user's limit.
        limit: u64,
    },

    /// The server asked the client to back off. Transient.
    #[error("throttled by block server: {reason}")]
    Throttled {
        /// Description from the server.
        reason: String,
    },

    /// The transport failed or the server is shut down. Transient.
    #[error("connection error: {reason}")]
    ConnectionError {
        /// Underlying failure.
        reason: String,
    },

    /// The caller canceled the operation.
    #[error("operation canceled")]
    Canceled,

    /// A response or stored record could not be decoded.
    #[error("malformed data: {reason}")]
    Malformed {
        /// What failed to decode.
        reason: String,
    },

    /// A put for an existing block carried different content or key.
    #[error("block {id} already exists with different content")]
    Mismatch {
        /// The conflicting block.
        id: BlockId,
    },

    /// The server replied with a status this client does not know.
    #[error("unexpected server status {code}: {message}")]
    Unexpected {
        /// Raw status code.
        code: u32,
        /// Server message.
        message: String,
    },

    /// Local filesystem failure in the on-disk store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("configuration error: {reason}")]
    Config {
        /// What is wrong.
        reason: String,
    },
}

impl BlockServerError {
    /// True for errors worth retrying after a wait.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BlockServerError::Throttled { .. } | BlockServerError::ConnectionError { .. }
        )
    }

    /// True for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlockServerError::NotFound { .. })
    }

    /// Error returned by a store after shutdown.
    pub(crate) fn shut_down() -> Self {
        BlockServerError::ConnectionError {
            reason: "block server is shut down".to_string(),
        }
    }

    /// Map a transport failure for an operation on `id` charged to `user`.
    pub(crate) fn from_transport(err: TransportError, id: &BlockId, user: &str) -> Self {
        match err {
            TransportError::Canceled { .. } => BlockServerError::Canceled,
            TransportError::Remote { code, message } => match StatusCode::from_u32(code) {
                Some(StatusCode::NotFound) => BlockServerError::NotFound { id: *id },
                Some(StatusCode::PermissionDenied) => {
                    BlockServerError::PermissionDenied { reason: message }
                }
                // The remote service does not report usage figures.
                Some(StatusCode::QuotaExceeded) => BlockServerError::QuotaExceeded {
                    user: user.to_string(),
                    used: 0,
                    limit: 0,
                },
                Some(StatusCode::Throttled) => BlockServerError::Throttled { reason: message },
                Some(StatusCode::BadRequest) => BlockServerError::Malformed { reason: message },
                Some(StatusCode::Internal) | None => BlockServerError::Unexpected { code, message },
            },
            TransportError::SerializationError(reason) => BlockServerError::Malformed { reason },
            err @ TransportError::PayloadTooLarge { .. } => BlockServerError::Malformed {
                reason: err.to_string(),
            },
            TransportError::Unauthenticated { reason } => {
                BlockServerError::PermissionDenied { reason }
            }
            other => BlockServerError::ConnectionError {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultfs_transport::CancelReason;

    fn id() -> BlockId {
        BlockId::from_data(b"x")
    }

    #[test]
    fn test_remote_codes_map_to_kinds() {
        let err = |code| {
            BlockServerError::from_transport(
                TransportError::Remote {
                    code,
                    message: "m".into(),
                },
                &id(),
                "alice",
            )
        };
        assert!(err(1).is_not_found());
        assert!(matches!(err(2), BlockServerError::PermissionDenied { .. }));
        assert!(matches!(err(3), BlockServerError::QuotaExceeded { .. }));
        assert!(matches!(err(4), BlockServerError::Throttled { .. }));
        assert!(matches!(err(5), BlockServerError::Malformed { .. }));
        assert!(matches!(err(99), BlockServerError::Unexpected { code: 99, .. }));
    }

    #[test]
    fn test_transport_failures_are_connection_errors() {
        let err = BlockServerError::from_transport(TransportError::ConnectionReset, &id(), "alice");
        assert!(matches!(err, BlockServerError::ConnectionError { .. }));
        assert!(err.is_retryable());

        let err = BlockServerError::from_transport(TransportError::Shutdown, &id(), "alice");
        assert!(matches!(err, BlockServerError::ConnectionError { .. }));
    }

    #[test]
    fn test_oversized_request_is_not_retryable() {
        let err = BlockServerError::from_transport(
            TransportError::PayloadTooLarge {
                size: 65 << 20,
                max_size: 64 << 20,
            },
            &id(),
            "alice",
        );
        assert!(matches!(err, BlockServerError::Malformed { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_session_outage_is_retryable() {
        let err = BlockServerError::from_transport(
            TransportError::SessionUnavailable {
                reason: "identity service down".into(),
            },
            &id(),
            "alice",
        );
        assert!(matches!(err, BlockServerError::ConnectionError { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_cancel_maps_to_canceled() {
        let err = BlockServerError::from_transport(
            TransportError::Canceled {
                reason: CancelReason::UserRequested,
            },
            &id(),
            "alice",
        );
        assert!(matches!(err, BlockServerError::Canceled));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unauthenticated_is_permission_denied() {
        let err = BlockServerError::from_transport(
            TransportError::Unauthenticated {
                reason: "no token".into(),
            },
            &id(),
            "alice",
        );
        assert!(matches!(err, BlockServerError::PermissionDenied { .. }));
    }
}
