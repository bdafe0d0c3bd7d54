//! Wire protocol types for host-script communication.
//!
//! One duplex channel carries every message kind as a tagged [`Frame`]:
//! handshake, proxy traffic records, invocations, and their results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Protocol version sent in the handshake. Peers must match exactly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Reserved capability name: returns the names registered on the other side.
pub const LIST_CAPABILITIES: &str = "listCapabilities";

/// Unique token linking an [`Invocation`] to its eventual [`CallResult`].
///
/// Monotonic per session and never reused within a session's lifetime, so a
/// stale result from an old timed-out call can never match a new call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Request,
    Response,
}

/// One intercepted HTTP request or response.
///
/// Immutable once created. The producing side owns it until it crosses the
/// channel; the receiver then owns its own copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub id: String,
    pub direction: Direction,
    /// Header order is significant for proxy traffic, so no map here.
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// A call from one side of the bridge to a capability on the other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub correlation_id: CorrelationId,
    pub target_capability: String,
    #[serde(default)]
    pub arguments: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

/// How an invocation ended. Exactly one of these (or a local timeout)
/// resolves each invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { value: serde_json::Value },
    Failure { kind: ErrorKind, message: String },
}

impl Outcome {
    pub fn success(value: serde_json::Value) -> Self {
        Self::Success { value }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// Resolution of one [`Invocation`], matched by correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub correlation_id: CorrelationId,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// First frame on a fresh connection, sent by the connecting script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    pub session_id: uuid::Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// Host's answer to [`Hello`]; carries the host-assigned session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloAck {
    pub protocol_version: u32,
    pub session_id: uuid::Uuid,
}

/// Top-level wire message. The `type` tag makes frames self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello(Hello),
    HelloAck(HelloAck),
    Traffic(TrafficRecord),
    Invoke(Invocation),
    Result(CallResult),
    /// Graceful-close signal; the receiver drains in-flight calls.
    Goodbye,
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::HelloAck(_) => "hello_ack",
            Self::Traffic(_) => "traffic",
            Self::Invoke(_) => "invoke",
            Self::Result(_) => "result",
            Self::Goodbye => "goodbye",
        }
    }
}

mod body_base64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
