//! pygate: bridge core linking an intercepting-proxy host to an external
//! Python scripting process over a framed, bidirectional RPC channel.
//!
//! The host binds an endpoint, the script connects, and both sides exchange
//! traffic records and capability invocations as length-prefixed JSON
//! frames. A [`Session`] supervises one connection lifetime: handshake,
//! receiver loop, fault isolation, and bounded reconnect.

pub mod bridge;

mod channel;
mod config;
mod dispatcher;
mod error;
mod registry;
mod session;
mod spawn;
mod traffic;

pub use channel::{
    BoundListener, BoxedByteStream, Channel, ChannelState, Endpoint, FrameReader, FrameWriter,
    connect, frame_stream,
};
pub use config::{BridgeConfig, RetryPolicy};
pub use dispatcher::{CallDispatcher, InvocationHandle};
pub use error::{BridgeError, ErrorKind};
pub use registry::{CapabilityHandler, GatewayRegistry};
pub use session::Session;
pub use spawn::{CONNECT_ENV, CommandSpawner, ExternalProcess, ScriptCommand, ScriptSpawner, SpawnError};
pub use traffic::{PROCESS_TRAFFIC, TrafficSink};

pub use bridge::protocol::{
    CallResult, CorrelationId, Direction, Frame, Hello, HelloAck, Invocation, LIST_CAPABILITIES,
    Outcome, PROTOCOL_VERSION, TrafficRecord,
};
