//! Common test utilities: a scripted fake block service.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use vaultfs_bserver::wire::{
    BlockReferenceRequest, EstablishSessionRequest, GetBlockRequest, GetBlockResponse,
    PutBlockRequest,
};
use vaultfs_bserver::{
    BlockContext, BlockCryptKeyServerHalf, BlockId, BlockServer, BlockServerError,
    BlockServerMemory, IdentityError, RefNonce, SessionSource, StatusCode, TlfId,
};
use vaultfs_transport::{
    deserialize_message, serialize_message, Ack, CancelToken, Frame, HandlerReply, Opcode,
    RemoteError, RpcHandler, RpcServer,
};

/// Knobs a test flips to change how the next requests are answered.
#[derive(Default)]
pub struct Script {
    /// Reject session establishment with PermissionDenied.
    pub reject_sessions: AtomicBool,
    /// Answer this many data calls with Throttled.
    pub throttle_next: AtomicUsize,
    /// Drop the connection on the next GetBlock.
    pub close_next_get: AtomicBool,
    /// Never answer data calls.
    pub hang: AtomicBool,
    /// Return an undecodable key half from GetBlock.
    pub corrupt_keys: AtomicBool,
}

/// In-process block service backed by [`BlockServerMemory`].
pub struct FakeBlockService {
    store: BlockServerMemory,
    pub script: Script,
    log: Mutex<Vec<Opcode>>,
    sessions: Mutex<Vec<EstablishSessionRequest>>,
}

fn status_for(err: &BlockServerError) -> StatusCode {
    match err {
        BlockServerError::NotFound { .. } => StatusCode::NotFound,
        BlockServerError::PermissionDenied { .. } => StatusCode::PermissionDenied,
        BlockServerError::QuotaExceeded { .. } => StatusCode::QuotaExceeded,
        BlockServerError::Throttled { .. } => StatusCode::Throttled,
        BlockServerError::Malformed { .. } | BlockServerError::Mismatch { .. } => {
            StatusCode::BadRequest
        }
        _ => StatusCode::Internal,
    }
}

fn error_reply(err: BlockServerError) -> HandlerReply {
    HandlerReply::Error(RemoteError::new(status_for(&err).as_u32(), err.to_string()))
}

fn ack() -> HandlerReply {
    HandlerReply::Reply(serialize_message(&Ack).unwrap())
}

fn bad_request(reason: impl Into<String>) -> HandlerReply {
    HandlerReply::Error(RemoteError::new(StatusCode::BadRequest.as_u32(), reason))
}

fn ctx_for(creator: &str, writer: &str, nonce: RefNonce) -> BlockContext {
    BlockContext {
        creator: creator.to_string(),
        writer: writer.to_string(),
        ref_nonce: nonce,
    }
}

impl FakeBlockService {
    /// Start serving on a loopback port.
    pub async fn start() -> (String, Arc<FakeBlockService>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let service = Arc::new(FakeBlockService {
            store: BlockServerMemory::new(None),
            script: Script::default(),
            log: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        });
        let handler: Arc<dyn RpcHandler> = service.clone();
        tokio::spawn(async move {
            let _ = RpcServer::serve(listener, handler).await;
        });
        (addr, service)
    }

    /// Opcodes received, in arrival order.
    pub fn log(&self) -> Vec<Opcode> {
        self.log.lock().clone()
    }

    /// Sessions established so far.
    pub fn sessions(&self) -> Vec<EstablishSessionRequest> {
        self.sessions.lock().clone()
    }

    async fn data_call(&self, request: &Frame) -> HandlerReply {
        let cancel = CancelToken::never();
        match request.opcode() {
            Opcode::GetBlock => {
                let Ok(req) = deserialize_message::<GetBlockRequest>(&request.payload) else {
                    return bad_request("get");
                };
                let Ok(id) = BlockId::from_hex(&req.bid.block_hash) else {
                    return bad_request("block id");
                };
                let ctx = ctx_for(&req.bid.charged_to, &req.bid.charged_to, RefNonce::ZERO);
                match self.store.get(&cancel, &id, &ctx).await {
                    Ok((data, key)) => {
                        let block_key = if self.script.corrupt_keys.load(Ordering::SeqCst) {
                            "zz-not-hex".to_string()
                        } else {
                            key.to_hex()
                        };
                        let resp = GetBlockResponse {
                            block_key,
                            buf: data.to_vec(),
                        };
                        HandlerReply::Reply(serialize_message(&resp).unwrap())
                    }
                    Err(e) => error_reply(e),
                }
            }
            Opcode::PutBlock => {
                let Ok(req) = deserialize_message::<PutBlockRequest>(&request.payload) else {
                    return bad_request("put");
                };
                let (Ok(id), Ok(key)) = (
                    BlockId::from_hex(&req.bid.block_hash),
                    BlockCryptKeyServerHalf::from_hex(&req.block_key),
                ) else {
                    return bad_request("put fields");
                };
                // The service keys a put's reference canonically.
                let ctx = ctx_for(&req.bid.charged_to, &req.bid.charged_to, RefNonce::ZERO);
                match self
                    .store
                    .put(&cancel, &id, &TlfId::new(req.folder), &ctx, Bytes::from(req.buf), &key)
                    .await
                {
                    Ok(()) => ack(),
                    Err(e) => error_reply(e),
                }
            }
            Opcode::IncBlockReference | Opcode::DecBlockReference => {
                let Ok(req) = deserialize_message::<BlockReferenceRequest>(&request.payload) else {
                    return bad_request("reference");
                };
                let Ok(id) = BlockId::from_hex(&req.bid.block_hash) else {
                    return bad_request("block id");
                };
                let ctx = ctx_for(&req.bid.charged_to, &req.charged_to, req.ref_nonce());
                let tlf = TlfId::new(req.folder.clone());
                let result = if request.opcode() == Opcode::IncBlockReference {
                    self.store.add_block_reference(&cancel, &id, &tlf, &ctx).await
                } else {
                    self.store.remove_block_reference(&cancel, &id, &tlf, &ctx).await
                };
                match result {
                    Ok(()) => ack(),
                    Err(e) => error_reply(e),
                }
            }
            other => bad_request(format!("unexpected opcode {:?}", other)),
        }
    }
}

#[async_trait]
impl RpcHandler for FakeBlockService {
    async fn handle(&self, request: Frame) -> HandlerReply {
        self.log.lock().push(request.opcode());

        if request.opcode() == Opcode::EstablishSession {
            if self.script.reject_sessions.load(Ordering::SeqCst) {
                return HandlerReply::Error(RemoteError::new(
                    StatusCode::PermissionDenied.as_u32(),
                    "session rejected",
                ));
            }
            let Ok(req) = deserialize_message::<EstablishSessionRequest>(&request.payload) else {
                return bad_request("session");
            };
            self.sessions.lock().push(req);
            return ack();
        }

        if request.opcode() == Opcode::GetBlock && self.script.close_next_get.swap(false, Ordering::SeqCst)
        {
            return HandlerReply::Close;
        }
        let throttled = self
            .script
            .throttle_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return HandlerReply::Error(RemoteError::new(StatusCode::Throttled.as_u32(), "slow down"));
        }
        if self.script.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.data_call(&request).await
    }
}

/// Identity whose token changes on every read.
pub struct RotatingSession {
    pub uid: String,
    pub issued: AtomicUsize,
}

impl RotatingSession {
    pub fn new(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            issued: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionSource for RotatingSession {
    async fn current_uid(&self) -> Result<String, IdentityError> {
        Ok(self.uid.clone())
    }

    async fn current_token(&self) -> Result<String, IdentityError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(format!("token-{}", n))
    }
}
