//! Transport channel: one duplex byte stream to the script process.
//!
//! The channel owns the write half of exactly one connection; the read half
//! is consumed by the session's receiver loop. State transitions are pushed
//! through a `watch` channel so the supervisor (and the hosting UI) can
//! observe them.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::Frame;
use crate::error::BridgeError;

/// Lifecycle of one script connection. Exactly one per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Ready,
    Draining,
    Failed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Failed => "failed",
        }
    }

    /// Frames may be sent in Ready, and while Draining so in-flight calls
    /// can still be answered.
    pub fn accepts_sends(&self) -> bool {
        matches!(self, Self::Ready | Self::Draining)
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the host listens for the script to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Endpoint {
    Tcp { addr: SocketAddr },
    #[cfg(unix)]
    Unix { path: PathBuf },
}

impl Endpoint {
    pub fn tcp(addr: SocketAddr) -> Self {
        Self::Tcp { addr }
    }

    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    pub async fn bind(&self) -> io::Result<BoundListener> {
        match self {
            Self::Tcp { addr } => Ok(BoundListener::Tcp(TcpListener::bind(addr).await?)),
            #[cfg(unix)]
            Self::Unix { path } => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Ok(BoundListener::Unix(tokio::net::UnixListener::bind(path)?))
            }
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { addr } => write!(f, "tcp:{addr}"),
            #[cfg(unix)]
            Self::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

/// A bound listener awaiting the single peer connection of a session.
pub enum BoundListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl BoundListener {
    /// The endpoint actually bound. Resolves port 0 to the assigned port.
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Self::Tcp(listener) => Ok(Endpoint::Tcp {
                addr: listener.local_addr()?,
            }),
            #[cfg(unix)]
            Self::Unix(listener) => {
                let addr = listener.local_addr()?;
                let path = addr
                    .as_pathname()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unnamed unix socket"))?;
                Ok(Endpoint::Unix {
                    path: path.to_path_buf(),
                })
            }
        }
    }

    pub async fn accept(&self) -> io::Result<BoxedByteStream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                tracing::debug!(%peer, "Peer connected");
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                tracing::debug!("Peer connected");
                Ok(Box::new(stream))
            }
        }
    }
}

/// Object-safe duplex byte stream; lets tests substitute in-memory pipes
/// for real sockets.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxedByteStream = Box<dyn ByteStream>;

pub type FrameReader = FramedRead<ReadHalf<BoxedByteStream>, FrameCodec>;
pub type FrameWriter = FramedWrite<WriteHalf<BoxedByteStream>, FrameCodec>;

/// Split a raw stream into the framed halves used by handshake and session.
pub fn frame_stream(stream: BoxedByteStream) -> (FrameReader, FrameWriter) {
    let (read_half, write_half) = tokio::io::split(stream);
    (
        FramedRead::new(read_half, FrameCodec::new()),
        FramedWrite::new(write_half, FrameCodec::new()),
    )
}

/// Connect to a listening host endpoint.
///
/// The host side of the bridge always binds; this is for the peer role,
/// which in production is the Python script but in tests is an in-process
/// fake driving the protocol.
pub async fn connect(endpoint: &Endpoint) -> io::Result<BoxedByteStream> {
    match endpoint {
        Endpoint::Tcp { addr } => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix { path } => Ok(Box::new(tokio::net::UnixStream::connect(path).await?)),
    }
}

/// Send half of the session's single duplex connection.
pub struct Channel {
    writer: tokio::sync::Mutex<FrameWriter>,
    state: watch::Receiver<ChannelState>,
}

impl Channel {
    pub fn new(writer: FrameWriter, state: watch::Receiver<ChannelState>) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
            state,
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Write one frame. Fails with `ChannelClosed` unless the session is
    /// Ready (or Draining, so in-flight calls can still be answered).
    pub async fn send(&self, frame: Frame) -> Result<(), BridgeError> {
        if !self.state().accepts_sends() {
            return Err(BridgeError::ChannelClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(frame).await?;
        Ok(())
    }
}
