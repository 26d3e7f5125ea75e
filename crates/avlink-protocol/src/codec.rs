//! Length-delimited framing.
//!
//! Every frame is a 4-byte big-endian body length followed by exactly that
//! many bytes of UTF-8 JSON. The same framing is used in both directions.
//!
//! `FramedMessageCodec` plugs into `tokio_util::codec::Framed`; `encode` and
//! `decode` are the synchronous single-frame equivalents.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use avlink_core::config::DEFAULT_MAX_FRAME_SIZE;

use crate::error::{DecodeError, FrameError};
use crate::message::{ControlMessage, Frame};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Streaming codec for `Frame`s.
#[derive(Debug, Clone)]
pub struct FramedMessageCodec {
    max_frame_size: usize,
}

impl FramedMessageCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FramedMessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FramedMessageCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let Some(size) = peek_length(src) else {
            return Ok(None);
        };
        if size > self.max_frame_size {
            return Err(DecodeError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            }
            .into());
        }

        let total = LENGTH_PREFIX_SIZE + size;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let body = src.split_to(size);
        Ok(Some(Frame::from_json(&body)?))
    }
}

impl Encoder<Frame> for FramedMessageCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = frame.to_json();
        if body.len() > self.max_frame_size {
            return Err(DecodeError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            }
            .into());
        }
        let size = u32::try_from(body.len()).map_err(|_| DecodeError::FrameTooLarge {
            size: body.len(),
            max: u32::MAX as usize,
        })?;

        dst.reserve(LENGTH_PREFIX_SIZE + body.len());
        dst.put_u32(size);
        dst.put_slice(body.as_bytes());
        Ok(())
    }
}

/// Encodes one request into a complete frame.
pub fn encode(message: &ControlMessage) -> Vec<u8> {
    encode_frame(&Frame::Request(message.clone()))
}

/// Encodes any frame into its wire bytes.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let body = frame.to_json();
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body.as_bytes());
    out
}

/// Decodes the first frame in `bytes` as a request.
///
/// Bytes after the first complete frame are ignored; callers reading a
/// stream resume at the next frame boundary.
pub fn decode(bytes: &[u8]) -> Result<ControlMessage, DecodeError> {
    match decode_frame(bytes)? {
        Frame::Request(message) => Ok(message),
        // A response body carries no `type`.
        Frame::Response(_) => Err(DecodeError::MissingKind),
    }
}

/// Decodes the first frame in `bytes`.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let size = peek_length(bytes).ok_or(DecodeError::LengthMismatch {
        expected: LENGTH_PREFIX_SIZE,
        actual: bytes.len(),
    })?;
    let body = bytes
        .get(LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + size)
        .ok_or(DecodeError::LengthMismatch {
            expected: size,
            actual: bytes.len().saturating_sub(LENGTH_PREFIX_SIZE),
        })?;
    Frame::from_json(body)
}

fn peek_length(bytes: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX_SIZE] = bytes.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}
