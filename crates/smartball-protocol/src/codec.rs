//! Frame codec shared by the BLE and serial transports.
//!
//! Wire format: type(1) | length(2, LE) | payload[length], 1 <= length <= MAX_PAYLOAD.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{FrameError, FRAME_HEADER_SIZE, MAX_PAYLOAD};

/// Placeholder payload for commands that carry no arguments.
/// The device parser drops zero-length frames, so they are never sent.
pub const EMPTY_PLACEHOLDER: [u8; 1] = [0x00];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame, checking the payload length bounds.
    pub fn new(msg_type: u8, payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        let payload = payload.into();
        check_length(payload.len())?;
        Ok(Self { msg_type, payload })
    }

    /// An argument-less command, carrying the 1-byte placeholder.
    pub fn command(msg_type: u8) -> Self {
        Self {
            msg_type,
            payload: Bytes::from_static(&EMPTY_PLACEHOLDER),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        out.push(self.msg_type);
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

fn check_length(length: usize) -> Result<(), FrameError> {
    if length == 0 || length > MAX_PAYLOAD {
        return Err(FrameError::InvalidLength {
            length,
            max: MAX_PAYLOAD,
        });
    }
    Ok(())
}

/// Encode `payload` as a frame of type `msg_type`.
pub fn encode(msg_type: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    check_length(payload.len())?;
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.push(msg_type);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one complete frame from the start of `bytes`.
/// Trailing bytes past the declared length are ignored.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(FrameError::MalformedFrame { len: bytes.len() });
    }
    let length = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
    check_length(length)?;
    let needed = FRAME_HEADER_SIZE + length;
    if bytes.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            have: bytes.len(),
        });
    }
    Ok(Frame {
        msg_type: bytes[0],
        payload: Bytes::copy_from_slice(&bytes[FRAME_HEADER_SIZE..needed]),
    })
}

/// Streaming codec for byte-stream transports.
///
/// In lenient mode a zero-length frame (the device's ABORT acknowledgment)
/// is consumed and dropped instead of failing the stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec {
    lenient: bool,
}

impl FrameCodec {
    pub fn strict() -> Self {
        Self { lenient: false }
    }

    pub fn lenient() -> Self {
        Self { lenient: true }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }

            let length = u16::from_le_bytes([src[1], src[2]]) as usize;

            if length == 0 && self.lenient {
                tracing::trace!(msg_type = src[0], "dropping zero-length frame");
                src.advance(FRAME_HEADER_SIZE);
                continue;
            }
            check_length(length)?;

            let total = FRAME_HEADER_SIZE + length;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let msg_type = src[0];
            src.advance(FRAME_HEADER_SIZE);
            let payload = src.split_to(length).freeze();
            return Ok(Some(Frame { msg_type, payload }));
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        check_length(item.payload.len())?;
        dst.reserve(item.wire_len());
        dst.put_u8(item.msg_type);
        dst.put_u16_le(item.payload.len() as u16);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}
