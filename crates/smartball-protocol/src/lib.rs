//! SmartBall Protocol -- OTA image format, wire frames, message types.
//!
//! Same framing on BLE (Nordic UART service) and serial:
//! 1-byte type + 2-byte little-endian length + payload.

pub mod checksum;
pub mod codec;
pub mod image;
pub mod messages;

pub use checksum::{crc32, verify_crc32_vector, Crc32Digest};
pub use codec::{decode, encode, Frame, FrameCodec};
pub use image::{build_image, OtaImage, OtaImageHeader};
pub use messages::*;

/// Image magic: "SBOT" (SmartBall OTA), stored little-endian.
pub const OTA_MAGIC: u32 = 0x5342_4F54;

/// Image header size: magic(4) + version(2) + payload_size(4) + payload_crc32(4).
pub const OTA_HEADER_SIZE: usize = 14;

/// Frame header size: type(1) + length(2).
pub const FRAME_HEADER_SIZE: usize = 3;

/// Largest frame payload the device parser accepts.
pub const MAX_PAYLOAD: usize = 512;

/// Largest chunk the device writes in one OTA_DATA.
pub const OTA_CHUNK_MAX: usize = 480;

/// OTA_DATA overhead around the chunk bytes: offset(4) + chunk_crc32(4).
pub const DATA_OVERHEAD: usize = 8;

/// Largest image the device staging slot can hold (496 KB).
pub const OTA_STAGING_SIZE: u32 = 496 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {len} bytes is shorter than the 3-byte header")]
    MalformedFrame { len: usize },
    #[error("invalid payload length {length} (must be 1..={max})")]
    InvalidLength { length: usize, max: usize },
    #[error("truncated frame: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("unexpected message type {got:#04x} (expected {expected:#04x})")]
    UnexpectedType { expected: u8, got: u8 },
    #[error("short payload for {what}: {len} bytes (need {need})")]
    ShortPayload {
        what: &'static str,
        len: usize,
        need: usize,
    },
    #[error("chunk of {len} bytes exceeds maximum {max}")]
    ChunkTooLarge { len: usize, max: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
