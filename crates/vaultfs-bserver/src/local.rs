//! On-disk block store.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<first two hex chars>/<hex id>/data   ciphertext
//!                                      /key    hex server key half
//!                                      /refs   JSON reference table
//! ```
//!
//! `refs` is written last when a block is created, so a block directory
//! without it is an interrupted put and is ignored. Mutations take the store
//! lock exclusively; reads share it.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};
use vaultfs_transport::CancelToken;

use crate::atomic_write::{is_temp_file, write_atomic};
use crate::block::{BlockContext, BlockCryptKeyServerHalf, BlockId, TlfId};
use crate::error::{BlockServerError, BlockServerResult};
use crate::memory::verify_content;
use crate::quota::QuotaLedger;
use crate::refs::{RefEntry, RefTable};
use crate::server::{check_cancel, check_put_context, BlockServer};

const DATA_FILE: &str = "data";
const KEY_FILE: &str = "key";
const REFS_FILE: &str = "refs";

/// Block store persisted in a directory tree.
pub struct BlockServerLocal {
    root: PathBuf,
    ledger: RwLock<QuotaLedger>,
    shut_down: AtomicBool,
}

async fn read_optional(path: &Path) -> BlockServerResult<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_refs(dir: &Path) -> BlockServerResult<Option<RefTable>> {
    let Some(bytes) = read_optional(&dir.join(REFS_FILE)).await? else {
        return Ok(None);
    };
    let table: RefTable = serde_json::from_slice(&bytes).map_err(|e| BlockServerError::Malformed {
        reason: format!("{}: {}", dir.join(REFS_FILE).display(), e),
    })?;
    Ok(Some(table))
}

async fn write_refs(dir: &Path, refs: &RefTable) -> BlockServerResult<()> {
    let json = serde_json::to_vec(refs).map_err(|e| BlockServerError::Malformed {
        reason: format!("encode refs: {}", e),
    })?;
    write_atomic(&dir.join(REFS_FILE), &json).await
}

async fn data_len(dir: &Path) -> BlockServerResult<u64> {
    Ok(tokio::fs::metadata(dir.join(DATA_FILE)).await?.len())
}

async fn read_key(dir: &Path) -> BlockServerResult<BlockCryptKeyServerHalf> {
    let raw = tokio::fs::read_to_string(dir.join(KEY_FILE)).await?;
    BlockCryptKeyServerHalf::from_hex(&raw)
}

fn ref_entry(tlf: &TlfId, ctx: &BlockContext) -> RefEntry {
    RefEntry {
        creator: ctx.creator.clone(),
        writer: ctx.writer.clone(),
        tlf: tlf.clone(),
    }
}

impl BlockServerLocal {
    /// Open (or create) a store at `root`, rebuilding usage from the stored
    /// reference tables.
    pub async fn open(root: impl Into<PathBuf>, quota_bytes: Option<u64>) -> BlockServerResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let mut ledger = QuotaLedger::new(quota_bytes);
        let mut blocks = 0usize;

        let mut prefixes = tokio::fs::read_dir(&root).await?;
        while let Some(prefix) = prefixes.next_entry().await? {
            if !prefix.file_type().await?.is_dir() {
                continue;
            }
            let mut dirs = tokio::fs::read_dir(prefix.path()).await?;
            while let Some(block_dir) = dirs.next_entry().await? {
                let dir = block_dir.path();
                if is_temp_file(&dir) || !block_dir.file_type().await?.is_dir() {
                    continue;
                }
                let refs = match read_refs(&dir).await {
                    Ok(Some(refs)) => refs,
                    Ok(None) => {
                        warn!(dir = %dir.display(), "block directory without refs, skipping");
                        continue;
                    }
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "unreadable refs, skipping");
                        continue;
                    }
                };
                let len = data_len(&dir).await?;
                for (_, entry) in refs.iter() {
                    ledger.charge(&entry.writer, len);
                }
                blocks += 1;
            }
        }

        info!(root = %root.display(), blocks, "opened on-disk block store");
        Ok(Self {
            root,
            ledger: RwLock::new(ledger),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn block_dir(&self, id: &BlockId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..2]).join(hex)
    }

    fn check(&self, cancel: &CancelToken) -> BlockServerResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(BlockServerError::shut_down());
        }
        check_cancel(cancel)
    }

    async fn read_lock(&self, cancel: &CancelToken) -> BlockServerResult<RwLockReadGuard<'_, QuotaLedger>> {
        self.check(cancel)?;
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BlockServerError::Canceled),
            guard = self.ledger.read() => guard,
        };
        self.check(cancel)?;
        Ok(guard)
    }

    async fn write_lock(&self, cancel: &CancelToken) -> BlockServerResult<RwLockWriteGuard<'_, QuotaLedger>> {
        self.check(cancel)?;
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BlockServerError::Canceled),
            guard = self.ledger.write() => guard,
        };
        self.check(cancel)?;
        Ok(guard)
    }

    /// Number of live references to `id`.
    pub async fn ref_count(&self, id: &BlockId) -> BlockServerResult<usize> {
        let _guard = self.ledger.read().await;
        Ok(read_refs(&self.block_dir(id)).await?.map_or(0, |r| r.len()))
    }

    /// Bytes charged to `user`.
    pub async fn usage(&self, user: &str) -> u64 {
        self.ledger.read().await.used(user)
    }
}

#[async_trait]
impl BlockServer for BlockServerLocal {
    async fn get(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        ctx: &BlockContext,
    ) -> BlockServerResult<(Bytes, BlockCryptKeyServerHalf)> {
        let _guard = self.read_lock(cancel).await?;
        let dir = self.block_dir(id);
        match read_refs(&dir).await? {
            Some(refs) if !refs.is_empty() => {}
            _ => return Err(BlockServerError::NotFound { id: *id }),
        }
        let data = tokio::fs::read(dir.join(DATA_FILE)).await?;
        let key = read_key(&dir).await?;
        debug!(id = %id, uid = %ctx.writer, size = data.len(), "disk get");
        Ok((Bytes::from(data), key))
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
        check_put_context(id, ctx)?;
        verify_content(id, &data)?;
        let mut ledger = self.write_lock(cancel).await?;
        let dir = self.block_dir(id);
        let len = data.len() as u64;

        if let Some(mut refs) = read_refs(&dir).await? {
            if !refs.is_empty() {
                let stored = tokio::fs::read(dir.join(DATA_FILE)).await?;
                let stored_key = read_key(&dir).await?;
                if stored[..] != data[..] || stored_key != *key_half {
                    return Err(BlockServerError::Mismatch { id: *id });
                }
                if !refs.contains(&ctx.ref_nonce) {
                    ledger.check(&ctx.writer, len)?;
                    refs.insert(ctx.ref_nonce, ref_entry(tlf, ctx));
                    write_refs(&dir, &refs).await?;
                    ledger.charge(&ctx.writer, len);
                }
                debug!(id = %id, uid = %ctx.writer, size = len, "disk put (existing)");
                return Ok(());
            }
        }

        ledger.check(&ctx.writer, len)?;
        tokio::fs::create_dir_all(&dir).await?;
        write_atomic(&dir.join(DATA_FILE), &data).await?;
        write_atomic(&dir.join(KEY_FILE), key_half.to_hex().as_bytes()).await?;
        let mut refs = RefTable::new();
        refs.insert(ctx.ref_nonce, ref_entry(tlf, ctx));
        write_refs(&dir, &refs).await?;
        ledger.charge(&ctx.writer, len);
        debug!(id = %id, uid = %ctx.writer, size = len, "disk put");
        Ok(())
    }

    async fn add_block_reference(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        tlf: &TlfId,
        ctx: &BlockContext,
    ) -> BlockServerResult<()> {
        let mut ledger = self.write_lock(cancel).await?;
        let dir = self.block_dir(id);
        let mut refs = match read_refs(&dir).await? {
            Some(refs) if !refs.is_empty() => refs,
            _ => return Err(BlockServerError::NotFound { id: *id }),
        };
        if refs.contains(&ctx.ref_nonce) {
            return Ok(());
        }
        let len = data_len(&dir).await?;
        ledger.check(&ctx.writer, len)?;
        refs.insert(ctx.ref_nonce, ref_entry(tlf, ctx));
        write_refs(&dir, &refs).await?;
        ledger.charge(&ctx.writer, len);
        debug!(id = %id, uid = %ctx.writer, nonce = %ctx.ref_nonce, refs = refs.len(), "disk add reference");
        Ok(())
    }

    async fn remove_block_reference(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        _tlf: &TlfId,
        ctx: &BlockContext,
    ) -> BlockServerResult<()> {
        let mut ledger = self.write_lock(cancel).await?;
        let dir = self.block_dir(id);
        let Some(mut refs) = read_refs(&dir).await? else {
            return Ok(());
        };
        let Some(removed) = refs.remove(&ctx.ref_nonce) else {
            return Ok(());
        };
        let len = data_len(&dir).await?;
        if refs.is_empty() {
            tokio::fs::remove_dir_all(&dir).await?;
        } else {
            write_refs(&dir, &refs).await?;
        }
        ledger.refund(&removed.writer, len);
        debug!(id = %id, uid = %ctx.writer, nonce = %ctx.ref_nonce, refs = refs.len(), "disk remove reference");
        Ok(())
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wait out in-flight mutations.
        self.ledger.write().await.clear();
        info!(root = %self.root.display(), "on-disk block store shut down");
    }

    fn name(&self) -> &'static str {
        "disk"
    }
}
