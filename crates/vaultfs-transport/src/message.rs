//! Payload encoding for RPC messages.
//!
//! Request and response bodies are serialized with bincode. Error responses
//! carry a [`RemoteError`] whose code space belongs to the service.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Serialize any serde-compatible message to bytes using bincode.
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| TransportError::SerializationError(e.to_string()))
}

/// Deserialize bytes to a message using bincode.
pub fn deserialize_message<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| TransportError::SerializationError(e.to_string()))
}

/// Body of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Service-defined status code.
    pub code: u32,
    /// Human-readable description.
    pub message: String,
}

impl RemoteError {
    /// Create a remote error.
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<RemoteError> for TransportError {
    fn from(err: RemoteError) -> Self {
        TransportError::Remote {
            code: err.code,
            message: err.message,
        }
    }
}

/// Empty body for calls that only report success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack;
