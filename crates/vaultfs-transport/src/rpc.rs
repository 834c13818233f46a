//! RPC layer providing request/response semantics over TCP connections.
//!
//! One [`RpcClient`] multiplexes any number of concurrent calls over a single
//! connection, matching responses to callers by request id. A background
//! reader task dispatches responses; when it stops, every outstanding call
//! fails with [`TransportError::ConnectionReset`] and the client is closed
//! for good.
//!
//! Requests are encoded by the caller and handed whole to a writer task, so
//! a call future dropped at any point never leaves a partial frame on the
//! socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::{new_cancel_pair, CancelReason, CancelToken};
use crate::error::{Result, TransportError};
use crate::message::{deserialize_message, serialize_message, RemoteError};
use crate::protocol::{check_payload_size, Frame, FrameFlags, Opcode};
use crate::tcp::TcpConnection;

/// Encoded frames waiting for the writer task.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Configuration for the RPC client.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Response timeout in milliseconds (default: 30000).
    pub response_timeout_ms: u64,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 30_000,
        }
    }
}

#[derive(Default)]
struct PendingCalls {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<Frame>>,
}

impl PendingCalls {
    /// Marks the table closed; dropping the senders wakes every waiter.
    fn close(&mut self) -> usize {
        self.closed = true;
        let n = self.waiters.len();
        self.waiters.clear();
        n
    }
}

/// Removes a pending entry when the call future completes or is dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<PendingCalls>,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().waiters.remove(&self.request_id);
    }
}

/// RPC client for sending requests and receiving responses.
pub struct RpcClient {
    conn: Arc<TcpConnection>,
    config: RpcClientConfig,
    next_id: AtomicU64,
    pending: Arc<Mutex<PendingCalls>>,
    closed_tx: Arc<watch::Sender<bool>>,
    write_tx: mpsc::Sender<Vec<u8>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcClient {
    /// Create a new RPC client. Starts the background reader and writer
    /// tasks.
    pub fn new(conn: Arc<TcpConnection>, config: RpcClientConfig) -> Self {
        let pending = Arc::new(Mutex::new(PendingCalls::default()));
        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let reader_conn = conn.clone();
        let reader_pending = pending.clone();
        let reader_closed = closed_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match reader_conn.recv_frame().await {
                    Ok(frame) if frame.is_response() => {
                        let tx = reader_pending.lock().waiters.remove(&frame.request_id());
                        match tx {
                            Some(tx) => {
                                let _ = tx.send(frame);
                            }
                            None => debug!(
                                request_id = frame.request_id(),
                                "dropping response for abandoned call"
                            ),
                        }
                    }
                    Ok(frame) => {
                        warn!(opcode = ?frame.opcode(), "ignoring unsolicited request frame");
                    }
                    Err(e) => {
                        warn!(peer = %reader_conn.peer_addr(), error = %e, "RPC reader stopped");
                        break;
                    }
                }
            }
            let failed = reader_pending.lock().close();
            if failed > 0 {
                debug!(failed, "failed outstanding calls after reader stop");
            }
            reader_closed.send_replace(true);
        });

        let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
        let writer_conn = conn.clone();
        let writer_pending = pending.clone();
        let writer_closed = closed_tx.clone();
        let writer = tokio::spawn(async move {
            while let Some(encoded) = write_rx.recv().await {
                if let Err(e) = writer_conn.send_encoded(&encoded).await {
                    warn!(peer = %writer_conn.peer_addr(), error = %e, "RPC send failed");
                    break;
                }
            }
            writer_pending.lock().close();
            writer_closed.send_replace(true);
        });

        Self {
            conn,
            config,
            next_id: AtomicU64::new(1),
            pending,
            closed_tx,
            write_tx,
            tasks: Mutex::new(vec![handle, writer]),
        }
    }

    /// Send a request and wait for its response.
    ///
    /// Error responses are decoded into [`TransportError::Remote`]. The call
    /// resolves early with [`TransportError::Canceled`] if `cancel` fires; a
    /// response arriving afterwards is discarded. A payload over
    /// [`crate::MAX_PAYLOAD_SIZE`] fails with
    /// [`TransportError::PayloadTooLarge`] before anything is sent.
    pub async fn call(&self, opcode: Opcode, payload: Vec<u8>, cancel: &CancelToken) -> Result<Frame> {
        if let Some(reason) = cancel.cancelled_reason() {
            return Err(TransportError::Canceled { reason });
        }
        check_payload_size(payload.len())?;
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(TransportError::ConnectionReset);
            }
            pending.waiters.insert(request_id, tx);
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id,
        };

        let encoded = Frame::new(opcode, request_id, payload).encode();
        let exchange = async {
            // Either the whole frame is queued or none of it is.
            self.write_tx
                .send(encoded)
                .await
                .map_err(|_| TransportError::ConnectionReset)?;
            rx.await.map_err(|_| TransportError::ConnectionReset)
        };

        let timeout = Duration::from_millis(self.config.response_timeout_ms);
        let response = tokio::select! {
            biased;
            reason = cancel.cancelled() => {
                debug!(request_id, opcode = ?opcode, %reason, "RPC call canceled");
                return Err(TransportError::Canceled { reason });
            }
            response = tokio::time::timeout(timeout, exchange) => response,
        };
        match response {
            Ok(Ok(frame)) if frame.is_error() => {
                let remote: RemoteError = deserialize_message(&frame.payload)?;
                Err(remote.into())
            }
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::RequestTimeout {
                request_id,
                timeout_ms: self.config.response_timeout_ms,
            }),
        }
    }

    /// Encode `request`, call, and decode the response body.
    pub async fn call_message<Q, R>(&self, opcode: Opcode, request: &Q, cancel: &CancelToken) -> Result<R>
    where
        Q: Serialize + Sync,
        R: DeserializeOwned,
    {
        let payload = serialize_message(request)?;
        let frame = self.call(opcode, payload, cancel).await?;
        deserialize_message(&frame.payload)
    }

    /// True once the connection can no longer carry calls.
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Resolves when the connection is closed for any reason.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        // The sender lives in self, so wait_for only fails after close.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Remote address of the underlying connection.
    pub fn peer_addr(&self) -> &str {
        self.conn.peer_addr()
    }

    /// Stop the reader, fail outstanding calls and close the socket.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.fail_all();
        self.conn.close().await;
    }

    fn fail_all(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.pending.lock().close();
        self.closed_tx.send_replace(true);
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

/// What a handler wants done with a request.
#[derive(Debug)]
pub enum HandlerReply {
    /// Send a successful response with this payload.
    Reply(Vec<u8>),
    /// Send an error response.
    Error(RemoteError),
    /// Drop the connection without answering.
    Close,
}

/// Trait for handling incoming RPC requests.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle a request.
    async fn handle(&self, request: Frame) -> HandlerReply;
}

/// RPC server that dispatches requests to a handler.
pub struct RpcServer;

impl RpcServer {
    /// Run the accept loop. Spawns a task per connection and a task per
    /// request, so a slow request does not block others on the same
    /// connection.
    pub async fn serve(listener: TcpListener, handler: Arc<dyn RpcHandler>) -> Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            debug!(peer = %peer_addr, "accepted connection");
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "failed to set TCP_NODELAY");
                }
                let conn = match TcpConnection::from_stream(stream) {
                    Ok(c) => Arc::new(c),
                    Err(e) => {
                        warn!(error = %e, "failed to create connection");
                        return;
                    }
                };
                Self::serve_connection(conn, handler).await;
            });
        }
    }

    async fn serve_connection(conn: Arc<TcpConnection>, handler: Arc<dyn RpcHandler>) {
        let (closing, close_handle) = new_cancel_pair();
        loop {
            let frame = tokio::select! {
                _ = closing.cancelled() => break,
                frame = conn.recv_frame() => match frame {
                    Ok(f) => f,
                    Err(e) => {
                        debug!(peer = %conn.peer_addr(), error = %e, "connection closed");
                        break;
                    }
                },
            };
            if frame.is_response() {
                warn!(peer = %conn.peer_addr(), "ignoring response frame sent to server");
                continue;
            }
            let conn = conn.clone();
            let handler = handler.clone();
            let close_handle = close_handle.clone();
            tokio::spawn(async move {
                let one_way = frame.header.flags.contains(FrameFlags::ONE_WAY);
                let response = match handler.handle(frame.clone()).await {
                    HandlerReply::Reply(payload) => frame.make_response(payload),
                    HandlerReply::Error(err) => match serialize_message(&err) {
                        Ok(payload) => frame.make_error_response(payload),
                        Err(e) => {
                            warn!(error = %e, "failed to encode error response");
                            return;
                        }
                    },
                    HandlerReply::Close => {
                        debug!(peer = %conn.peer_addr(), "handler requested close");
                        close_handle.cancel(CancelReason::Shutdown);
                        conn.close().await;
                        return;
                    }
                };
                if one_way || close_handle.is_cancelled() {
                    return;
                }
                if let Err(e) = conn.send_frame(&response).await {
                    warn!(error = %e, "failed to send response");
                }
            });
        }
        conn.close().await;
    }
}
