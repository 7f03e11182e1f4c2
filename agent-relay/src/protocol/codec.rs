//! Length-prefixed JSON frame codec.
//!
//! Wire format: a 4-byte big-endian unsigned length followed by that many
//! bytes of one UTF-8 JSON object.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

// Layer 3: Internal module imports
use super::error::ProtocolError;
use super::frames::{ClientFrame, ServerFrame};

const LEN_PREFIX: usize = 4;

/// Default maximum frame size (2 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;

/// Codec for u32-BE length-prefixed JSON frames.
///
/// Decoding yields the raw JSON bytes of one frame; the session layer parses
/// them so it can distinguish unknown frame types from malformed payloads.
/// Frames whose declared length exceeds `max_frame_bytes` fail decoding and
/// the connection is closed with `payload_too_large`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    /// Create a codec with a custom frame bound.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&src[..LEN_PREFIX]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }

        if src.len() < LEN_PREFIX + len {
            // Reserve the remainder so the next read can complete the frame.
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        Ok(Some(src.split_to(len).freeze()))
    }
}

fn encode_json(
    payload: Vec<u8>,
    max: usize,
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    if payload.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max,
        });
    }
    dst.reserve(LEN_PREFIX + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(&payload);
    Ok(())
}

impl Encoder<ServerFrame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: ServerFrame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        encode_json(serde_json::to_vec(&frame)?, self.max_frame_bytes, dst)
    }
}

impl Encoder<ClientFrame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: ClientFrame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        encode_json(serde_json::to_vec(&frame)?, self.max_frame_bytes, dst)
    }
}
