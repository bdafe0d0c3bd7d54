//! Framed codec for the script channel.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (sockets, pipes, in-memory duplex).

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::Frame;

/// One fully-framed unit off the wire.
///
/// A frame whose payload fails to parse decodes to `Malformed` instead of
/// erroring the stream: the length prefix was already consumed, so the read
/// loop can log, drop it, and stay aligned on the next frame.
#[derive(Debug)]
pub enum Decoded {
    Frame(Frame),
    Malformed { detail: String },
}

/// Codec that frames messages with a length prefix and serializes with JSON.
///
/// Truncated input is never an error; `decode` returns `None` until a full
/// frame has been buffered.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(frame) => Ok(Some(Decoded::Frame(frame))),
                Err(e) => Ok(Some(Decoded::Malformed {
                    detail: e.to_string(),
                })),
            },
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}
