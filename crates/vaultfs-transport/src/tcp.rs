//! TCP transport: dialing, listening and framed reads/writes.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, FrameHeader, FRAME_HEADER_SIZE};

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// Creates TCP connections.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Establishes a TCP connection to the specified address.
    pub async fn connect(&self, addr: &str) -> Result<TcpConnection> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            })?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
                    addr: addr.to_string(),
                },
                _ => TransportError::IoError(e),
            })?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(addr = addr, "TCP connected");
        TcpConnection::from_stream(stream)
    }

    /// Binds to the specified address and returns a listener.
    pub async fn listen(&self, addr: &str) -> Result<TcpListener> {
        Ok(TcpListener::bind(addr).await?)
    }

    /// Accepts an incoming TCP connection from the listener.
    pub async fn accept(&self, listener: &TcpListener) -> Result<TcpConnection> {
        let (stream, _) = listener.accept().await?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        TcpConnection::from_stream(stream)
    }
}

/// A single TCP connection with independent read and write halves.
pub struct TcpConnection {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
    peer_addr: String,
    local_addr: String,
}

impl TcpConnection {
    pub(crate) fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let local_addr = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (read, write) = stream.into_split();
        Ok(Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            peer_addr,
            local_addr,
        })
    }

    /// Sends a frame over the connection.
    ///
    /// Not cancel safe: dropping the future mid-write leaves a partial frame
    /// on the socket. Shared connections write through one task instead.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.send_encoded(&frame.encode()).await
    }

    /// Writes one already-encoded frame.
    pub(crate) async fn send_encoded(&self, encoded: &[u8]) -> Result<()> {
        let mut write = self.write.lock().await;
        write.write_all(encoded).await?;
        write.flush().await?;
        Ok(())
    }

    /// Receives the next frame from the connection.
    pub async fn recv_frame(&self) -> Result<Frame> {
        let mut read = self.read.lock().await;
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        read.read_exact(&mut header_buf).await?;
        let header = FrameHeader::decode(&header_buf)?;
        let mut payload = vec![0u8; header.payload_length as usize];
        if !payload.is_empty() {
            read.read_exact(&mut payload).await?;
        }
        let frame = Frame { header, payload };
        frame.validate()?;
        Ok(frame)
    }

    /// Shuts down the write half; the peer observes end-of-stream.
    pub async fn close(&self) {
        let mut write = self.write.lock().await;
        if let Err(e) = write.shutdown().await {
            tracing::debug!(peer = %self.peer_addr, error = %e, "TCP shutdown failed");
        }
    }

    /// Remote peer address.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Local address.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }
}
