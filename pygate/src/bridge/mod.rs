//! Wire protocol and codec for host-script communication.
//!
//! Everything crossing the process boundary is a length-prefixed,
//! type-tagged [`protocol::Frame`] encoded by [`codec::FrameCodec`].
//!
//! # Architecture
//!
//! - **protocol**: Message types (Frame, TrafficRecord, Invocation, CallResult)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
