//! Request and response bodies of the block service protocol.
//!
//! Bodies are bincode-encoded (see [`vaultfs_transport::serialize_message`]).
//! Block ids and server key halves travel as lowercase hex strings.

use serde::{Deserialize, Serialize};

use crate::block::{BlockContext, BlockCryptKeyServerHalf, BlockId, RefNonce, TlfId};

/// Status codes carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    /// No live reference for the block.
    NotFound = 1,
    /// Session or charged user not allowed.
    PermissionDenied = 2,
    /// Charged user over quota.
    QuotaExceeded = 3,
    /// Server backpressure; retry later.
    Throttled = 4,
    /// Request could not be decoded or was inconsistent.
    BadRequest = 5,
    /// Server-side failure.
    Internal = 6,
}

impl StatusCode {
    /// Numeric form.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Parse a numeric code; `None` for codes this client does not know.
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(StatusCode::NotFound),
            2 => Some(StatusCode::PermissionDenied),
            3 => Some(StatusCode::QuotaExceeded),
            4 => Some(StatusCode::Throttled),
            5 => Some(StatusCode::BadRequest),
            6 => Some(StatusCode::Internal),
            _ => None,
        }
    }
}

/// Session establishment request. Must precede every other call on a
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstablishSessionRequest {
    /// Session user.
    pub user: String,
    /// Session token.
    pub sid: String,
}

/// Names a block and the account a request is charged to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIdCombo {
    /// Hex block id.
    pub block_hash: String,
    /// Account charged.
    pub charged_to: String,
}

impl BlockIdCombo {
    /// Build a combo for `id` charged to `user`.
    pub fn new(id: &BlockId, user: &str) -> Self {
        Self {
            block_hash: id.to_hex(),
            charged_to: user.to_string(),
        }
    }
}

/// Fetch a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockRequest {
    /// Block and charged user (the context's writer).
    pub bid: BlockIdCombo,
}

/// Block contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockResponse {
    /// Hex server key half.
    pub block_key: String,
    /// Ciphertext.
    #[serde(with = "serde_bytes")]
    pub buf: Vec<u8>,
}

/// Store a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutBlockRequest {
    /// Block and charged user (the context's writer).
    pub bid: BlockIdCombo,
    /// Hex server key half.
    pub block_key: String,
    /// Folder the write is accounted to.
    pub folder: String,
    /// Ciphertext.
    #[serde(with = "serde_bytes")]
    pub buf: Vec<u8>,
}

/// Add or remove one counted reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReferenceRequest {
    /// Block and its creator.
    pub bid: BlockIdCombo,
    /// Folder the reference is accounted to.
    pub folder: String,
    /// Account charged (the context's writer).
    pub charged_to: String,
    /// Reference nonce, byte for byte.
    pub nonce: [u8; 8],
}

impl GetBlockRequest {
    /// Request for `id` under `ctx`.
    pub fn new(id: &BlockId, ctx: &BlockContext) -> Self {
        Self {
            bid: BlockIdCombo::new(id, &ctx.writer),
        }
    }
}

impl PutBlockRequest {
    /// Request storing `data` as `id`.
    pub fn new(
        id: &BlockId,
        tlf: &TlfId,
        ctx: &BlockContext,
        data: &[u8],
        key_half: &BlockCryptKeyServerHalf,
    ) -> Self {
        Self {
            bid: BlockIdCombo::new(id, &ctx.writer),
            block_key: key_half.to_hex(),
            folder: tlf.as_str().to_string(),
            buf: data.to_vec(),
        }
    }
}

impl BlockReferenceRequest {
    /// Request naming the reference `(id, ctx.ref_nonce)`.
    pub fn new(id: &BlockId, tlf: &TlfId, ctx: &BlockContext) -> Self {
        Self {
            bid: BlockIdCombo::new(id, &ctx.creator),
            folder: tlf.as_str().to_string(),
            charged_to: ctx.writer.clone(),
            nonce: ctx.ref_nonce.0,
        }
    }

    /// The reference nonce.
    pub fn ref_nonce(&self) -> RefNonce {
        RefNonce(self.nonce)
    }
}
