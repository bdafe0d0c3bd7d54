//! Error types for the bridge.

use serde::{Deserialize, Serialize};

use crate::channel::ChannelState;

/// Failure categories carried inside a [`crate::bridge::protocol::Outcome`].
///
/// These cross the wire, so the set is shared by convention with the script
/// side. Codec and handler failures are contained at the component that
/// detected them; only session-level failures reach the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Frame could not be decoded. Non-fatal, the message is dropped.
    MalformedMessage,
    /// No result arrived before the invocation deadline.
    Timeout,
    /// The caller withdrew its own pending invocation.
    Cancelled,
    /// No handler registered under the target capability name.
    UnknownCapability,
    /// A local handler returned an error or panicked.
    HandlerError,
    /// Send or invoke attempted while the channel is not ready.
    ChannelClosed,
    /// The session failed with the call still in flight.
    SessionLost,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedMessage => "malformed_message",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::UnknownCapability => "unknown_capability",
            Self::HandlerError => "handler_error",
            Self::ChannelClosed => "channel_closed",
            Self::SessionLost => "session_lost",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-facing errors from session and channel operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("channel is not ready")]
    ChannelClosed,
    #[error("timed out waiting for peer to connect")]
    ConnectTimeout,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("failed to spawn script process: {0}")]
    Spawn(String),
    #[error("operation not valid while session is {0}")]
    InvalidState(ChannelState),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
