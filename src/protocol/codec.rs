//! Length-prefixed JSON framing for [`Frame`] values.
//!
//! The envelope is a 4-byte big-endian length followed by the JSON body.
//! Oversized frames are rejected before any allocation happens.

use super::Frame;
use bytes::{Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Default upper bound for a single frame body (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Errors produced while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Socket failure, or a length prefix over the limit.
    #[error("transport failure: {0}")]
    Io(#[from] io::Error),

    /// A complete frame whose body is not a valid [`Frame`].
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl CodecError {
    /// Malformed frames are protocol errors; everything else is a transport failure.
    pub fn is_protocol_error(&self) -> bool {
        match self {
            CodecError::Malformed(_) => true,
            CodecError::Io(err) => err.kind() == io::ErrorKind::InvalidData,
        }
    }
}

/// Codec turning a byte stream into [`Frame`]s and back.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    /// Codec with the default frame size limit.
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Codec rejecting frames larger than `max_frame_bytes`.
    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        let inner = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(max_frame_bytes)
            .new_codec();
        Self { inner }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        match self.inner.decode(src)? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = serde_json::to_vec(&frame)?;
        self.inner.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}
