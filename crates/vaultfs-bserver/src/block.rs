//! Core block types: identifiers, reference contexts and key material.

use core::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{BlockServerError, BlockServerResult};

/// Opaque account identifier.
pub type UserId = String;

/// Content hash of a block's ciphertext. The CAS key; never recomputed after
/// creation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub [u8; 32]);

impl BlockId {
    /// Hash `data` (BLAKE3) into a block id.
    pub fn from_data(data: &[u8]) -> Self {
        BlockId(*blake3::hash(data).as_bytes())
    }

    /// Parse a lowercase or uppercase hex rendering.
    pub fn from_hex(s: &str) -> BlockServerResult<Self> {
        let bytes = hex::decode(s).map_err(|e| BlockServerError::Malformed {
            reason: format!("block id: {}", e),
        })?;
        let arr: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| BlockServerError::Malformed {
            reason: format!("block id: expected 32 bytes, got {}", v.len()),
        })?;
        Ok(BlockId(arr))
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.to_hex())
    }
}

/// Distinguishes one counted reference to a block from another.
/// The all-zero nonce is the canonical one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct RefNonce(pub [u8; 8]);

impl RefNonce {
    /// The canonical (all-zero) nonce.
    pub const ZERO: RefNonce = RefNonce([0u8; 8]);

    /// Draw a fresh random nonce.
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        RefNonce(bytes)
    }

    /// True for the canonical nonce.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for RefNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for RefNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefNonce({})", self.to_hex())
    }
}

/// Identifies the logical folder a write is accounted to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TlfId(pub String);

impl TlfId {
    /// Create a folder id.
    pub fn new(id: impl Into<String>) -> Self {
        TlfId(id.into())
    }

    /// String form used on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TlfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who is touching a block, and through which reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockContext {
    /// Charged for the canonical reference when incrementing.
    pub creator: UserId,
    /// Charged for quota on every operation.
    pub writer: UserId,
    /// Which reference this context names.
    pub ref_nonce: RefNonce,
}

impl BlockContext {
    /// Context for the first reference to a block, created by `user`.
    pub fn first(user: impl Into<UserId>) -> Self {
        let user = user.into();
        Self {
            creator: user.clone(),
            writer: user,
            ref_nonce: RefNonce::ZERO,
        }
    }

    /// Context for an additional reference written by `writer` with a fresh
    /// random nonce.
    pub fn new_reference(creator: impl Into<UserId>, writer: impl Into<UserId>) -> Self {
        Self {
            creator: creator.into(),
            writer: writer.into(),
            ref_nonce: RefNonce::random(),
        }
    }
}

/// Length in bytes of a server key half.
pub const KEY_HALF_LEN: usize = 32;

/// The server's half of a block's encryption key. Opaque to this layer.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct BlockCryptKeyServerHalf([u8; KEY_HALF_LEN]);

impl BlockCryptKeyServerHalf {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; KEY_HALF_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a random key half.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_HALF_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Decode the hex wire form. Bad hex or a wrong length is `Malformed`.
    pub fn from_hex(s: &str) -> BlockServerResult<Self> {
        let mut bytes = hex::decode(s.trim()).map_err(|e| BlockServerError::Malformed {
            reason: format!("server key half: {}", e),
        })?;
        if bytes.len() != KEY_HALF_LEN {
            let len = bytes.len();
            bytes.zeroize();
            return Err(BlockServerError::Malformed {
                reason: format!("server key half: expected {} bytes, got {}", KEY_HALF_LEN, len),
            });
        }
        let mut arr = [0u8; KEY_HALF_LEN];
        arr.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self(arr))
    }

    /// Hex wire form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_HALF_LEN] {
        &self.0
    }
}

impl fmt::Debug for BlockCryptKeyServerHalf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockCryptKeyServerHalf([REDACTED])")
    }
}
