//! Session-aware connection manager.
//!
//! A [`ConnectionManager`] owns one logical connection to a remote service and
//! drives it through [`ConnectionState`]:
//!
//! ```text
//! Disconnected -> Connecting -> SessionEstablishing -> Connected
//!       ^              |                 |                 |
//!       +--------------+-----------------+-----------------+  (failure / broken transport)
//! ```
//!
//! The lifecycle hooks live on a [`ConnectionHandler`]. The manager invokes
//! them at the transitions only, classifies errors, and reports failed
//! attempts together with a suggested wait from its [`BackoffPolicy`]. It never
//! retries on its own: the next call after a failure starts a fresh attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
use crate::error::{Result, TransportError};
use crate::message::{deserialize_message, serialize_message};
use crate::protocol::{Frame, Opcode};
use crate::rpc::{RpcClient, RpcClientConfig};
use crate::tcp::{TcpTransport, TcpTransportConfig};

/// Lifecycle state of a managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; the next call dials.
    Disconnected,
    /// TCP connect in progress.
    Connecting,
    /// Connected at the transport level, session not yet established.
    SessionEstablishing,
    /// Ready for data calls.
    Connected,
}

/// Hooks invoked by the [`ConnectionManager`] at well-defined transitions.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Establish the session on a freshly dialed connection. No other call is
    /// issued on `client` before this returns `Ok`.
    async fn on_connect(&self, client: &RpcClient, cancel: &CancelToken) -> Result<()>;

    /// A connect or session attempt failed; `wait` is the suggested delay
    /// before trying again.
    fn on_connect_error(&self, err: &TransportError, wait: Duration);

    /// An established connection was lost.
    fn on_disconnected(&self);

    /// True if `err` is server backpressure rather than a failure.
    fn should_throttle(&self, err: &TransportError) -> bool;
}

/// Connection manager configuration.
#[derive(Debug, Clone, Default)]
pub struct ConnectionManagerConfig {
    /// TCP dial settings.
    pub tcp: TcpTransportConfig,
    /// RPC settings for each connection.
    pub rpc: RpcClientConfig,
}

struct Slot {
    client: Option<Arc<RpcClient>>,
}

struct Shared {
    addr: String,
    transport: TcpTransport,
    rpc_config: RpcClientConfig,
    handler: Arc<dyn ConnectionHandler>,
    backoff: Mutex<Box<dyn BackoffPolicy>>,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
    failed_attempts: AtomicU64,
    shutdown: CancelToken,
    shutdown_handle: CancelHandle,
}

impl Shared {
    fn live_client(&self) -> Option<Arc<RpcClient>> {
        let slot = self.slot.lock();
        slot.client.as_ref().filter(|c| !c.is_closed()).cloned()
    }

    /// Callers hold the slot lock so state and client change together.
    fn set_state(&self, _slot: &Slot, state: ConnectionState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            debug!(addr = %self.addr, from = ?prev, to = ?state, "connection state change");
        }
    }

    /// Drops `client` if it is still the current connection. Returns true if
    /// this call performed the transition.
    fn mark_disconnected(&self, client: &Arc<RpcClient>) -> bool {
        {
            let mut slot = self.slot.lock();
            match &slot.client {
                Some(current) if Arc::ptr_eq(current, client) => {
                    slot.client = None;
                    self.set_state(&slot, ConnectionState::Disconnected);
                }
                _ => return false,
            }
        }
        warn!(addr = %self.addr, "connection lost");
        self.handler.on_disconnected();
        true
    }

    async fn dial_and_establish(&self, cancel: &CancelToken) -> Result<Arc<RpcClient>> {
        self.set_state(&self.slot.lock(), ConnectionState::Connecting);
        let conn = tokio::select! {
            biased;
            reason = cancel.cancelled() => return Err(TransportError::Canceled { reason }),
            _ = self.shutdown.cancelled() => return Err(TransportError::Shutdown),
            conn = self.transport.connect(&self.addr) => conn?,
        };
        let client = Arc::new(RpcClient::new(Arc::new(conn), self.rpc_config.clone()));

        self.set_state(&self.slot.lock(), ConnectionState::SessionEstablishing);
        let established = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TransportError::Shutdown),
            r = self.handler.on_connect(&client, cancel) => r,
        };
        if let Err(e) = established {
            client.shutdown().await;
            return Err(e);
        }
        Ok(client)
    }
}

/// Owns one logical connection to a remote service.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a manager for `addr` with the default backoff policy. No
    /// connection is made until the first call.
    pub fn new(
        addr: impl Into<String>,
        config: ConnectionManagerConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        Self::with_backoff(addr, config, handler, Box::new(ExponentialBackoff::default()))
    }

    /// Create a manager with an explicit backoff policy.
    pub fn with_backoff(
        addr: impl Into<String>,
        config: ConnectionManagerConfig,
        handler: Arc<dyn ConnectionHandler>,
        backoff: Box<dyn BackoffPolicy>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, shutdown_handle) = new_cancel_pair();
        Self {
            shared: Arc::new(Shared {
                addr: addr.into(),
                transport: TcpTransport::new(config.tcp),
                rpc_config: config.rpc,
                handler,
                backoff: Mutex::new(backoff),
                slot: Mutex::new(Slot { client: None }),
                state_tx,
                connect_lock: tokio::sync::Mutex::new(()),
                failed_attempts: AtomicU64::new(0),
                shutdown,
                shutdown_handle,
            }),
        }
    }

    /// Address of the remote service.
    pub fn remote_address(&self) -> &str {
        &self.shared.addr
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// True after [`ConnectionManager::shutdown`].
    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Return a connected, session-established client, dialing if needed.
    ///
    /// At most one establishment runs at a time. Callers that wait on an
    /// attempt which then fails get [`TransportError::NotConnected`] rather
    /// than starting another one.
    pub async fn client(&self, cancel: &CancelToken) -> Result<Arc<RpcClient>> {
        let s = &self.shared;
        if s.shutdown.is_cancelled() {
            return Err(TransportError::Shutdown);
        }
        if let Some(client) = s.live_client() {
            return Ok(client);
        }

        let failures_before = s.failed_attempts.load(Ordering::SeqCst);
        let _guard = tokio::select! {
            biased;
            reason = cancel.cancelled() => return Err(TransportError::Canceled { reason }),
            _ = s.shutdown.cancelled() => return Err(TransportError::Shutdown),
            guard = s.connect_lock.lock() => guard,
        };
        if let Some(client) = s.live_client() {
            return Ok(client);
        }
        if s.failed_attempts.load(Ordering::SeqCst) != failures_before {
            return Err(TransportError::NotConnected);
        }
        // A previous connection may have closed without the watcher having
        // run yet.
        let stale = s.slot.lock().client.clone();
        if let Some(stale) = stale {
            if s.mark_disconnected(&stale) {
                stale.shutdown().await;
            }
        }

        match s.dial_and_establish(cancel).await {
            Ok(client) => {
                let stored = {
                    let mut slot = s.slot.lock();
                    if s.shutdown.is_cancelled() {
                        s.set_state(&slot, ConnectionState::Disconnected);
                        false
                    } else {
                        slot.client = Some(client.clone());
                        s.set_state(&slot, ConnectionState::Connected);
                        true
                    }
                };
                if !stored {
                    client.shutdown().await;
                    return Err(TransportError::Shutdown);
                }
                s.backoff.lock().reset();
                info!(addr = %s.addr, "connection established");
                self.spawn_watcher(client.clone());
                Ok(client)
            }
            Err(e) => {
                s.set_state(&s.slot.lock(), ConnectionState::Disconnected);
                match e {
                    TransportError::Canceled { .. } | TransportError::Shutdown => {
                        debug!(addr = %s.addr, error = %e, "connection attempt abandoned");
                    }
                    _ => {
                        s.failed_attempts.fetch_add(1, Ordering::SeqCst);
                        let wait = s.backoff.lock().next_wait();
                        warn!(
                            addr = %s.addr,
                            error = %e,
                            wait_ms = wait.as_millis() as u64,
                            "connection attempt failed"
                        );
                        s.handler.on_connect_error(&e, wait);
                    }
                }
                Err(e)
            }
        }
    }

    fn spawn_watcher(&self, client: Arc<RpcClient>) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                _ = client.closed() => {}
            }
            if shared.mark_disconnected(&client) {
                client.shutdown().await;
            }
        });
    }

    /// Issue one RPC on the managed connection.
    ///
    /// Throttling errors are returned unchanged and never affect the
    /// connection; connection-level errors drop it so the next call
    /// reconnects.
    pub async fn call(&self, opcode: Opcode, payload: Vec<u8>, cancel: &CancelToken) -> Result<Frame> {
        let client = self.client(cancel).await?;
        match client.call(opcode, payload, cancel).await {
            Ok(frame) => Ok(frame),
            Err(e) => {
                if self.shared.handler.should_throttle(&e) {
                    debug!(addr = %self.shared.addr, opcode = ?opcode, "server throttled call");
                } else if e.is_connection_error() && self.shared.mark_disconnected(&client) {
                    client.shutdown().await;
                }
                Err(e)
            }
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

    /// Close the connection and fail every waiting or in-flight call.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let s = &self.shared;
        if !s.shutdown.is_cancelled() {
            info!(addr = %s.addr, "shutting down connection manager");
        }
        s.shutdown_handle.cancel(CancelReason::Shutdown);
        let client = {
            let mut slot = s.slot.lock();
            let client = slot.client.take();
            s.set_state(&slot, ConnectionState::Disconnected);
            client
        };
        if let Some(client) = client {
            client.shutdown().await;
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.shutdown_handle.cancel(CancelReason::Shutdown);
    }
}
