//! Client for a remote block service.
//!
//! Each operation is one round trip on a [`ConnectionManager`]. The session
//! half ([`RemoteSession`]) establishes a session with the current identity
//! every time a connection is made and tells the manager which errors are
//! server throttling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, warn};
use vaultfs_transport::{
    Ack, BackoffPolicy, CancelToken, ConnectionHandler, ConnectionManager, ConnectionManagerConfig,
    ConnectionState, Opcode, RpcClient, TransportError,
};

use crate::block::{BlockContext, BlockCryptKeyServerHalf, BlockId, TlfId};
use crate::error::{BlockServerError, BlockServerResult};
use crate::identity::{IdentityError, SessionSource};
use crate::server::{check_cancel, check_put_context, BlockServer};
use crate::wire::{
    BlockReferenceRequest, EstablishSessionRequest, GetBlockRequest, GetBlockResponse,
    PutBlockRequest, StatusCode,
};

/// Connection hooks for the block service.
pub struct RemoteSession {
    addr: String,
    session: Arc<dyn SessionSource>,
}

impl RemoteSession {
    /// Hooks for `addr` drawing identity from `session`.
    pub fn new(addr: impl Into<String>, session: Arc<dyn SessionSource>) -> Self {
        Self {
            addr: addr.into(),
            session,
        }
    }
}

fn identity_failure(err: IdentityError) -> TransportError {
    match err {
        IdentityError::NotLoggedIn => TransportError::Unauthenticated {
            reason: err.to_string(),
        },
        IdentityError::Unavailable(_) => TransportError::SessionUnavailable {
            reason: err.to_string(),
        },
    }
}

#[async_trait]
impl ConnectionHandler for RemoteSession {
    async fn on_connect(&self, client: &RpcClient, cancel: &CancelToken) -> vaultfs_transport::Result<()> {
        let identity = async {
            let uid = self.session.current_uid().await.map_err(identity_failure)?;
            let token = self.session.current_token().await.map_err(identity_failure)?;
            Ok::<_, TransportError>((uid, token))
        };
        let (uid, token) = tokio::select! {
            biased;
            reason = cancel.cancelled() => return Err(TransportError::Canceled { reason }),
            identity = identity => identity?,
        };

        let request = EstablishSessionRequest {
            user: uid.clone(),
            sid: token,
        };
        let _: Ack = client
            .call_message(Opcode::EstablishSession, &request, cancel)
            .await?;
        debug!(addr = %self.addr, uid = %uid, "block server session established");
        Ok(())
    }

    fn on_connect_error(&self, err: &TransportError, wait: Duration) {
        warn!(
            addr = %self.addr,
            error = %err,
            wait_ms = wait.as_millis() as u64,
            "connection to block server failed, retry suggested after wait"
        );
    }

    fn on_disconnected(&self) {
        warn!(addr = %self.addr, "block server disconnected");
    }

    fn should_throttle(&self, err: &TransportError) -> bool {
        err.remote_code() == Some(StatusCode::Throttled.as_u32())
    }
}

/// Block store backed by a remote block service.
pub struct BlockServerRemote {
    conn: ConnectionManager,
}

fn log_call<T>(op: &'static str, id: &BlockId, uid: &str, size: usize, result: &BlockServerResult<T>) {
    match result {
        Ok(_) => debug!(op, id = %id, uid = %uid, size, "block server call done"),
        Err(e) => debug!(op, id = %id, uid = %uid, size, error = %e, "block server call failed"),
    }
}

impl BlockServerRemote {
    /// Client for the service at `addr`. Nothing is dialed until the first
    /// operation.
    pub fn new(
        addr: impl Into<String>,
        session: Arc<dyn SessionSource>,
        config: ConnectionManagerConfig,
    ) -> Self {
        let addr = addr.into();
        let handler = Arc::new(RemoteSession::new(addr.clone(), session));
        Self {
            conn: ConnectionManager::new(addr, config, handler),
        }
    }

    /// Client with an explicit reconnect backoff policy.
    pub fn with_backoff(
        addr: impl Into<String>,
        session: Arc<dyn SessionSource>,
        config: ConnectionManagerConfig,
        backoff: Box<dyn BackoffPolicy>,
    ) -> Self {
        let addr = addr.into();
        let handler = Arc::new(RemoteSession::new(addr.clone(), session));
        Self {
            conn: ConnectionManager::with_backoff(addr, config, handler, backoff),
        }
    }

    /// Address of the block service.
    pub fn remote_address(&self) -> &str {
        self.conn.remote_address()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.conn.subscribe()
    }
}

#[async_trait]
impl BlockServer for BlockServerRemote {
    async fn get(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        ctx: &BlockContext,
    ) -> BlockServerResult<(Bytes, BlockCryptKeyServerHalf)> {
        let result: BlockServerResult<(Bytes, BlockCryptKeyServerHalf)> = async {
            check_cancel(cancel)?;
            let request = GetBlockRequest::new(id, ctx);
            let response: GetBlockResponse = self
                .conn
                .call_message(Opcode::GetBlock, &request, cancel)
                .await
                .map_err(|e| BlockServerError::from_transport(e, id, &ctx.writer))?;
            let key = BlockCryptKeyServerHalf::from_hex(&response.block_key)?;
            Ok::<_, BlockServerError>((Bytes::from(response.buf), key))
        }
        .await;
        let size = result.as_ref().map_or(0, |(data, _)| data.len());
        log_call("get", id, &ctx.writer, size, &result);
        result
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
        let result: BlockServerResult<()> = async {
            check_cancel(cancel)?;
            check_put_context(id, ctx)?;
            let request = PutBlockRequest::new(id, tlf, ctx, &data, key_half);
            let _: Ack = self
                .conn
                .call_message(Opcode::PutBlock, &request, cancel)
                .await
                .map_err(|e| BlockServerError::from_transport(e, id, &ctx.writer))?;
            Ok::<_, BlockServerError>(())
        }
        .await;
        log_call("put", id, &ctx.writer, data.len(), &result);
        result
    }

    async fn add_block_reference(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        tlf: &TlfId,
        ctx: &BlockContext,
    ) -> BlockServerResult<()> {
        let result = self
            .reference_call(Opcode::IncBlockReference, cancel, id, tlf, ctx)
            .await;
        log_call("add reference", id, &ctx.writer, 0, &result);
        result
    }

    async fn remove_block_reference(
        &self,
        cancel: &CancelToken,
        id: &BlockId,
        tlf: &TlfId,
        ctx: &BlockContext,
    ) -> BlockServerResult<()> {
        let result = self
            .reference_call(Opcode::DecBlockReference, cancel, id, tlf, ctx)
            .await;
        log_call("remove reference", id, &ctx.writer, 0, &result);
        result
    }

    async fn shutdown(&self) {
        self.conn.shutdown().await;
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

impl BlockServerRemote {
    async fn reference_call(
        &self,
        opcode: Opcode,
        cancel: &CancelToken,
        id: &BlockId,
        tlf: &TlfId,
        ctx: &BlockContext,
    ) -> BlockServerResult<()> {
        check_cancel(cancel)?;
        let request = BlockReferenceRequest::new(id, tlf, ctx);
        let _: Ack = self
            .conn
            .call_message(opcode, &request, cancel)
            .await
            .map_err(|e| BlockServerError::from_transport(e, id, &ctx.writer))?;
        Ok(())
    }
}
