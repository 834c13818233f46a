#![warn(missing_docs)]

//! VaultFS block server subsystem: content-addressed, reference-counted block
//! storage behind one contract
//!
//! Blocks are immutable encrypted buffers named by the BLAKE3 hash of their
//! ciphertext. Many filesystem objects may share a block; each holds a counted
//! reference distinguished by a nonce, and the block's storage is reclaimed
//! once its last reference is removed. The [`BlockServer`] trait is served
//! in memory, from a local directory tree, or by a remote block service over
//! a session-authenticated connection.

pub mod atomic_write;
pub mod block;
pub mod config;
pub mod error;
pub mod identity;
pub mod init;
pub mod local;
pub mod logging;
pub mod memory;
pub mod quota;
pub mod refs;
pub mod remote;
pub mod server;
pub mod wire;

pub use block::{BlockContext, BlockCryptKeyServerHalf, BlockId, RefNonce, TlfId, UserId, KEY_HALF_LEN};
pub use config::{Backend, StorageConfig, ENV_BSERVER_ADDR, ENV_MDSERVER_ADDR};
pub use error::{BlockServerError, BlockServerResult};
pub use identity::{IdentityError, SessionSource, StaticSession};
pub use init::{init, shutdown};
pub use local::BlockServerLocal;
pub use logging::init_logging;
pub use memory::BlockServerMemory;
pub use quota::QuotaLedger;
pub use refs::{RefEntry, RefRecord, RefTable};
pub use remote::{BlockServerRemote, RemoteSession};
pub use server::{BlockServer, BlockServerKind};
pub use wire::StatusCode;
