//! The block store contract and the closed set of its implementations.

use async_trait::async_trait;
use bytes::Bytes;
use vaultfs_transport::CancelToken;

use crate::block::{BlockContext, BlockCryptKeyServerHalf, BlockId, TlfId};
use crate::error::{BlockServerError, BlockServerResult};
use crate::local::BlockServerLocal;
use crate::memory::BlockServerMemory;
use crate::remote::BlockServerRemote;

/// Content-addressed, reference-counted block storage.
///
/// Every data operation is bound to the caller's [`CancelToken`]; a canceled
/// operation returns [`BlockServerError::Canceled`]. Implementations are
/// shared across tasks.
#[async_trait]
pub trait BlockServer: Send + Sync {
    /// Fetch a block's ciphertext and server key half.
    async fn get(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        ctx: &BlockContext,
    ) -> BlockServerResult<(Bytes, BlockCryptKeyServerHalf)>;

    /// Store a block and create its canonical reference. `ctx` must carry
    /// the zero nonce; any other nonce is rejected as malformed. Putting
    /// identical content again succeeds.
    async fn put(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        tlf: &TlfId,
        ctx: &BlockContext,
        data: Bytes,
        key_half: &BlockCryptKeyServerHalf,
    ) -> BlockServerResult<()>;

    /// Add the reference `(id, ctx.ref_nonce)`, charged to `ctx.writer`.
    async fn add_block_reference(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        tlf: &TlfId,
        ctx: &BlockContext,
    ) -> BlockServerResult<()>;

    /// Remove the reference `(id, ctx.ref_nonce)`. Removing a reference that
    /// is not live is a no-op.
    async fn remove_block_reference(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        tlf: &TlfId,
        ctx: &BlockContext,
    ) -> BlockServerResult<()>;

    /// Release every resource. Idempotent.
    async fn shutdown(&self);

    /// Short name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Fail fast if the caller has already canceled.
pub(crate) fn check_cancel(cancel: &CancelToken) -> BlockServerResult<()> {
    if cancel.is_cancelled() {
        return Err(BlockServerError::Canceled);
    }
    Ok(())
}

/// Reject a put whose context is not the canonical reference.
pub(crate) fn check_put_context(id: &BlockId, ctx: &BlockContext) -> BlockServerResult<()> {
    if !ctx.ref_nonce.is_zero() {
        return Err(BlockServerError::Malformed {
            reason: format!(
                "put of {} carries reference nonce {}; put creates only the canonical reference",
                id,
                ctx.ref_nonce.to_hex()
            ),
        });
    }
    Ok(())
}

/// The block store selected at init.
pub enum BlockServerKind {
    /// Process-local, volatile.
    Memory(BlockServerMemory),
    /// Directory tree on local disk.
    Local(BlockServerLocal),
    /// Remote block service.
    Remote(BlockServerRemote),
}

impl BlockServerKind {
    fn inner(&self) -> &dyn BlockServer {
        match self {
            BlockServerKind::Memory(s) => s,
            BlockServerKind::Local(s) => s,
            BlockServerKind::Remote(s) => s,
        }
    }
}

#[async_trait]
impl BlockServer for BlockServerKind {
    async fn get(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        ctx: &BlockContext,
    ) -> BlockServerResult<(Bytes, BlockCryptKeyServerHalf)> {
        self.inner().get(cancel, id, ctx).await
    }

    async fn put(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        tlf: &TlfId,
        ctx: &BlockContext,
        data: Bytes,
        key_half: &BlockCryptKeyServerHalf,
    ) -> BlockServerResult<()> {
        self.inner().put(cancel, id, tlf, ctx, data, key_half).await
    }

    async fn add_block_reference(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        tlf: &TlfId,
        ctx: &BlockContext,
    ) -> BlockServerResult<()> {
        self.inner().add_block_reference(cancel, id, tlf, ctx).await
    }

    async fn remove_block_reference(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        tlf: &TlfId,
        ctx: &BlockContext,
    ) -> BlockServerResult<()> {
        self.inner().remove_block_reference(cancel, id, tlf, ctx).await
    }

    async fn shutdown(&self) {
        self.inner().shutdown().await
    }

    fn name(&self) -> &'static str {
        self.inner().name()
    }
}
