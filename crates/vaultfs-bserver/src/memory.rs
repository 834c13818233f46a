//! In-memory block store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;
use vaultfs_transport::CancelToken;

use crate::block::{BlockContext, BlockCryptKeyServerHalf, BlockId, TlfId};
use crate::error::{BlockServerError, BlockServerResult};
use crate::quota::QuotaLedger;
use crate::refs::{RefEntry, RefTable};
use crate::server::{check_cancel, check_put_context, BlockServer};

struct BlockEntry {
    data: Bytes,
    key_half: BlockCryptKeyServerHalf,
    refs: RefTable,
}

struct MemoryState {
    blocks: HashMap<BlockId, BlockEntry>,
    ledger: QuotaLedger,
}

/// Volatile block store for tests and single-process deployments.
pub struct BlockServerMemory {
    state: RwLock<MemoryState>,
    shut_down: AtomicBool,
}

pub(crate) fn verify_content(id: &BlockId, data: &[u8]) -> BlockServerResult<()> {
    if BlockId::from_data(data) != *id {
        return Err(BlockServerError::Malformed {
            reason: format!("block id {} does not match its content", id),
        });
    }
    Ok(())
}

fn ref_entry(tlf: &TlfId, ctx: &BlockContext) -> RefEntry {
    RefEntry {
        creator: ctx.creator.clone(),
        writer: ctx.writer.clone(),
        tlf: tlf.clone(),
    }
}

impl BlockServerMemory {
    /// Create an empty store; `quota_bytes` limits each writer.
    pub fn new(quota_bytes: Option<u64>) -> Self {
        Self {
            state: RwLock::new(MemoryState {
                blocks: HashMap::new(),
                ledger: QuotaLedger::new(quota_bytes),
            }),
            shut_down: AtomicBool::new(false),
        }
    }

    fn check(&self, cancel: &CancelToken) -> BlockServerResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(BlockServerError::shut_down());
        }
        check_cancel(cancel)
    }

    /// Number of live references to `id`.
    pub fn ref_count(&self, id: &BlockId) -> usize {
        self.state.read().blocks.get(id).map_or(0, |e| e.refs.len())
    }

    /// Number of stored blocks.
    pub fn block_count(&self) -> usize {
        self.state.read().blocks.len()
    }

    /// Bytes charged to `user`.
    pub fn usage(&self, user: &str) -> u64 {
        self.state.read().ledger.used(user)
    }
}

#[async_trait]
impl BlockServer for BlockServerMemory {
    async fn get(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        ctx: &BlockContext,
    ) -> BlockServerResult<(Bytes, BlockCryptKeyServerHalf)> {
        self.check(cancel)?;
        let state = self.state.read();
        match state.blocks.get(id) {
            Some(entry) if !entry.refs.is_empty() => {
                debug!(id = %id, uid = %ctx.writer, size = entry.data.len(), "memory get");
                Ok((entry.data.clone(), entry.key_half.clone()))
            }
            _ => Err(BlockServerError::NotFound { id: *id }),
        }
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
        self.check(cancel)?;
        check_put_context(id, ctx)?;
        verify_content(id, &data)?;
        let len = data.len() as u64;
        let mut guard = self.state.write();
        let state = &mut *guard;

        if let Some(entry) = state.blocks.get_mut(id) {
            if entry.data != data || entry.key_half != *key_half {
                return Err(BlockServerError::Mismatch { id: *id });
            }
            if !entry.refs.contains(&ctx.ref_nonce) {
                state.ledger.check(&ctx.writer, len)?;
                entry.refs.insert(ctx.ref_nonce, ref_entry(tlf, ctx));
                state.ledger.charge(&ctx.writer, len);
            }
            debug!(id = %id, uid = %ctx.writer, size = len, "memory put (existing)");
            return Ok(());
        }

        state.ledger.check(&ctx.writer, len)?;
        let mut refs = RefTable::new();
        refs.insert(ctx.ref_nonce, ref_entry(tlf, ctx));
        state.blocks.insert(
            *id,
            BlockEntry {
                data,
                key_half: key_half.clone(),
                refs,
            },
        );
        state.ledger.charge(&ctx.writer, len);
        debug!(id = %id, uid = %ctx.writer, size = len, "memory put");
        Ok(())
    }

    async fn add_block_reference(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        tlf: &TlfId,
        ctx: &BlockContext,
    ) -> BlockServerResult<()> {
        self.check(cancel)?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let entry = match state.blocks.get_mut(id) {
            Some(entry) if !entry.refs.is_empty() => entry,
            _ => return Err(BlockServerError::NotFound { id: *id }),
        };
        if entry.refs.contains(&ctx.ref_nonce) {
            return Ok(());
        }
        let len = entry.data.len() as u64;
        state.ledger.check(&ctx.writer, len)?;
        entry.refs.insert(ctx.ref_nonce, ref_entry(tlf, ctx));
        state.ledger.charge(&ctx.writer, len);
        debug!(
            id = %id,
            uid = %ctx.writer,
            nonce = %ctx.ref_nonce,
            refs = entry.refs.len(),
            "memory add reference"
        );
        Ok(())
    }

    async fn remove_block_reference(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        _tlf: &TlfId,
        ctx: &BlockContext,
    ) -> BlockServerResult<()> {
        self.check(cancel)?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let Some(entry) = state.blocks.get_mut(id) else {
            return Ok(());
        };
        let Some(removed) = entry.refs.remove(&ctx.ref_nonce) else {
            return Ok(());
        };
        let len = entry.data.len() as u64;
        state.ledger.refund(&removed.writer, len);
        let remaining = entry.refs.len();
        if remaining == 0 {
            state.blocks.remove(id);
        }
        debug!(id = %id, uid = %ctx.writer, nonce = %ctx.ref_nonce, refs = remaining, "memory remove reference");
        Ok(())
    }

    async fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            let mut state = self.state.write();
            state.blocks.clear();
            state.ledger.clear();
            debug!("memory block server shut down");
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultfs_transport::{new_cancel_pair, CancelReason};

    fn block(content: &'static [u8]) -> (BlockId, Bytes) {
        let data = Bytes::from_static(content);
        (BlockId::from_data(&data), data)
    }

    fn tlf() -> TlfId {
        TlfId::new("tlf")
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let server = BlockServerMemory::new(None);
        let cancel = CancelToken::never();
        let (id, data) = block(b"hello");
        let ctx = BlockContext::first("alice");
        let key = BlockCryptKeyServerHalf::random();

        server.put(&cancel, &id, &tlf(), &ctx, data.clone(), &key).await.unwrap();
        let (got, got_key) = server.get(&cancel, &id, &ctx).await.unwrap();
        assert_eq!(got, data);
        assert_eq!(got_key, key);
        assert_eq!(server.usage("alice"), 5);
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let server = BlockServerMemory::new(None);
        let cancel = CancelToken::never();
        let (id, data) = block(b"same");
        let ctx = BlockContext::first("alice");
        let key = BlockCryptKeyServerHalf::random();

        server.put(&cancel, &id, &tlf(), &ctx, data.clone(), &key).await.unwrap();
        server.put(&cancel, &id, &tlf(), &ctx, data.clone(), &key).await.unwrap();
        assert_eq!(server.ref_count(&id), 1);
        assert_eq!(server.usage("alice"), 4);
    }

    #[tokio::test]
    async fn test_put_mismatched_key_rejected() {
        let server = BlockServerMemory::new(None);
        let cancel = CancelToken::never();
        let (id, data) = block(b"same");
        let ctx = BlockContext::first("alice");

        server
            .put(&cancel, &id, &tlf(), &ctx, data.clone(), &BlockCryptKeyServerHalf::random())
            .await
            .unwrap();
        let err = server
            .put(&cancel, &id, &tlf(), &ctx, data, &BlockCryptKeyServerHalf::random())
            .await
            .unwrap_err();
        assert!(matches!(err, BlockServerError::Mismatch { .. }));
    }

    #[tokio::test]
    async fn test_put_wrong_id_is_malformed() {
        let server = BlockServerMemory::new(None);
        let (id, _) = block(b"one");
        let err = server
            .put(
                &CancelToken::never(),
                &id,
                &tlf(),
                &BlockContext::first("alice"),
                Bytes::from_static(b"two"),
                &BlockCryptKeyServerHalf::random(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BlockServerError::Malformed { .. }));
        assert_eq!(server.block_count(), 0);
    }

    #[tokio::test]
    async fn test_references_keep_block_alive() {
        let server = BlockServerMemory::new(None);
        let cancel = CancelToken::never();
        let (id, data) = block(b"shared");
        let first = BlockContext::first("alice");
        let second = BlockContext::new_reference("alice", "bob");
        let key = BlockCryptKeyServerHalf::random();

        server.put(&cancel, &id, &tlf(), &first, data, &key).await.unwrap();
        server.add_block_reference(&cancel, &id, &tlf(), &second).await.unwrap();
        server.add_block_reference(&cancel, &id, &tlf(), &second).await.unwrap();
        assert_eq!(server.ref_count(&id), 2);
        assert_eq!(server.usage("bob"), 6);

        server.remove_block_reference(&cancel, &id, &tlf(), &first).await.unwrap();
        assert!(server.get(&cancel, &id, &second).await.is_ok());
        assert_eq!(server.usage("alice"), 0);

        server.remove_block_reference(&cancel, &id, &tlf(), &second).await.unwrap();
        let err = server.get(&cancel, &id, &second).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(server.block_count(), 0);
        assert_eq!(server.usage("bob"), 0);
    }

    #[tokio::test]
    async fn test_add_reference_missing_block() {
        let server = BlockServerMemory::new(None);
        let (id, _) = block(b"ghost");
        let err = server
            .add_block_reference(&CancelToken::never(), &id, &tlf(), &BlockContext::first("alice"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_remove_missing_reference_is_noop() {
        let server = BlockServerMemory::new(None);
        let cancel = CancelToken::never();
        let (id, data) = block(b"keep");
        let ctx = BlockContext::first("alice");
        server
            .put(&cancel, &id, &tlf(), &ctx, data, &BlockCryptKeyServerHalf::random())
            .await
            .unwrap();

        let stranger = BlockContext::new_reference("alice", "mallory");
        server.remove_block_reference(&cancel, &id, &tlf(), &stranger).await.unwrap();
        let (ghost, _) = block(b"ghost");
        server.remove_block_reference(&cancel, &ghost, &tlf(), &ctx).await.unwrap();
        assert_eq!(server.ref_count(&id), 1);
    }

    #[tokio::test]
    async fn test_quota_exceeded_leaves_state_unchanged() {
        let server = BlockServerMemory::new(Some(10));
        let cancel = CancelToken::never();
        let (id, data) = block(b"0123456789");
        let ctx = BlockContext::first("alice");
        server
            .put(&cancel, &id, &tlf(), &ctx, data, &BlockCryptKeyServerHalf::random())
            .await
            .unwrap();

        let more = BlockContext::new_reference("alice", "alice");
        let err = server.add_block_reference(&cancel, &id, &tlf(), &more).await.unwrap_err();
        assert!(matches!(err, BlockServerError::QuotaExceeded { used: 10, limit: 10, .. }));
        assert_eq!(server.ref_count(&id), 1);
        assert_eq!(server.usage("alice"), 10);

        let (big, big_data) = block(b"x");
        let err = server
            .put(&cancel, &big, &tlf(), &ctx, big_data, &BlockCryptKeyServerHalf::random())
            .await
            .unwrap_err();
        assert!(matches!(err, BlockServerError::QuotaExceeded { .. }));
        assert_eq!(server.block_count(), 1);
    }

    #[tokio::test]
    async fn test_canceled_before_call() {
        let server = BlockServerMemory::new(None);
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::UserRequested);
        let (id, _) = block(b"x");
        let err = server.get(&token, &id, &BlockContext::first("a")).await.unwrap_err();
        assert!(matches!(err, BlockServerError::Canceled));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_final() {
        let server = BlockServerMemory::new(None);
        server.shutdown().await;
        server.shutdown().await;
        let (id, _) = block(b"x");
        let err = server
            .get(&CancelToken::never(), &id, &BlockContext::first("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlockServerError::ConnectionError { .. }));
    }
}
