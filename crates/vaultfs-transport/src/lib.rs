#![warn(missing_docs)]

//! VaultFS transport subsystem: framed RPC over TCP, cancellation, and a
//! session-aware connection manager
//!
//! The block server client sits on top of this crate. It supplies a
//! [`ConnectionHandler`] that establishes a session on each new connection and
//! classifies server throttling; the [`ConnectionManager`] handles dialing,
//! state transitions and reconnect-on-next-call.

pub mod backoff;
pub mod cancel;
pub mod connection;
pub mod error;
pub mod message;
pub mod protocol;
pub mod rpc;
pub mod tcp;

pub use backoff::{BackoffConfig, BackoffPolicy, ExponentialBackoff};
pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
pub use connection::{ConnectionHandler, ConnectionManager, ConnectionManagerConfig, ConnectionState};
pub use error::{Result, TransportError};
pub use message::{deserialize_message, serialize_message, Ack, RemoteError};
pub use protocol::{check_payload_size, Frame, FrameFlags, FrameHeader, Opcode, FRAME_HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
pub use rpc::{HandlerReply, RpcClient, RpcClientConfig, RpcHandler, RpcServer};
pub use tcp::{TcpConnection, TcpTransport, TcpTransportConfig};
