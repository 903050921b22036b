//! # Transport Abstraction
//!
//! A minimal, async interface for moving frames between processes.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about frames or values.
//!   It moves opaque buffers, one buffer per message.
//! - **Duplex**: Either side may send at any time; replies are correlated
//!   above this layer.

use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

/// Default upper bound on a single frame, in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The operation timed out.
    Timeout,
    /// A frame exceeded the configured maximum size.
    PayloadTooLarge { size: usize, max: usize },
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Timeout => write!(f, "Transport timed out"),
            Self::PayloadTooLarge { size, max } => {
                write!(f, "Frame of {} bytes exceeds limit of {}", size, max)
            }
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => Self::ConnectionLost(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A bidirectional message pipe.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one message.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Receives the next message. `Ok(None)` means the peer closed cleanly.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Stops sending; the peer's `recv` observes end of stream.
    async fn close(&self) {}
}

/// Length-prefixed frames over a TCP stream.
///
/// Each frame is a big-endian `u32` length followed by that many bytes.
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    peer: Option<SocketAddr>,
    max_frame_size: usize,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, max_frame_size: usize) -> Self {
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer,
            max_frame_size,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_frame_size {
            return Err(Error::PayloadTooLarge { size: payload.len(), max: self.max_frame_size });
        }
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::PayloadTooLarge { size: payload.len(), max: u32::MAX as usize })?;

        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(payload);

        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;

        let mut header = [0u8; 4];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame_size {
            return Err(Error::PayloadTooLarge { size: len, max: self.max_frame_size });
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        Ok(Some(body))
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// An in-process duplex transport over tokio mpsc channels.
///
/// Messages sent on one end appear on the other end's `recv()`.
pub struct MemoryTransport {
    tx: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryTransport {
    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: StdMutex::new(Some(tx_a)),
            rx: Mutex::new(rx_b),
        };

        let b = Self {
            tx: StdMutex::new(Some(tx_b)),
            rx: Mutex::new(rx_a),
        };

        (a, b)
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let Some(tx) = self.sender() else {
            return Err(Error::ConnectionLost("Channel closed".into()));
        };
        tx.send(payload.to_vec())
            .map_err(|_| Error::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}
