//! OTA message types.
//!
//! Commands go host -> device; the device answers every command with a
//! single `RSP_OTA` frame and additionally pushes PROGRESS / READY
//! notifications while it erases the staging slot.

use bytes::{BufMut, BytesMut};

use crate::checksum::crc32;
use crate::codec::Frame;
use crate::{ProtocolError, DATA_OVERHEAD, MAX_PAYLOAD};

// ============================================================================
// Opcodes
// ============================================================================

pub const CMD_OTA_START: u8 = 0x10;
pub const CMD_OTA_DATA: u8 = 0x11;
pub const CMD_OTA_FINISH: u8 = 0x12;
pub const CMD_OTA_ABORT: u8 = 0x13;
pub const CMD_OTA_STATUS: u8 = 0x16;
pub const CMD_OTA_CONFIRM: u8 = 0x17;
pub const CMD_OTA_REBOOT: u8 = 0x18;

/// Generic OTA response: result code + command-specific payload.
pub const RSP_OTA: u8 = 0x90;
/// Erase progress notification: payload = erased bytes (u32).
pub const MSG_OTA_PROGRESS: u8 = 0x91;
/// Staging slot erased, device accepts OTA_DATA.
pub const MSG_OTA_READY: u8 = 0x92;

/// Slot written by OTA_START (staging slot B).
pub const STAGING_SLOT: u8 = 1;

/// Result code carried in the first payload byte of `RSP_OTA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// START accepted; also the "ok" code of DATA/CONFIRM/REBOOT replies.
    OkStart,
    OkFinish,
    ErrSize,
    ErrSizeMismatch,
    ErrChunk,
    ErrBadMagic,
    ErrChunkCrc,
    ErrBadOffset,
    ErrCrcMismatch,
    Unknown(u8),
}

impl ResultCode {
    pub fn as_u8(self) -> u8 {
        match self {
            ResultCode::OkStart => 0x00,
            ResultCode::OkFinish => 0x01,
            ResultCode::ErrSize => 0x02,
            ResultCode::ErrSizeMismatch => 0x03,
            ResultCode::ErrChunk => 0x04,
            ResultCode::ErrBadMagic => 0x05,
            ResultCode::ErrChunkCrc => 0x06,
            ResultCode::ErrBadOffset => 0x07,
            ResultCode::ErrCrcMismatch => 0x08,
            ResultCode::Unknown(code) => code,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ResultCode::OkStart => "ok",
            ResultCode::OkFinish => "ok_finish",
            ResultCode::ErrSize => "invalid total size",
            ResultCode::ErrSizeMismatch => "bytes received != total size",
            ResultCode::ErrChunk => "chunk out of bounds",
            ResultCode::ErrBadMagic => "bad image magic",
            ResultCode::ErrChunkCrc => "chunk crc mismatch",
            ResultCode::ErrBadOffset => "bad offset",
            ResultCode::ErrCrcMismatch => "image crc mismatch",
            ResultCode::Unknown(_) => "unknown",
        }
    }
}

impl From<u8> for ResultCode {
    fn from(code: u8) -> Self {
        match code {
            0x00 => ResultCode::OkStart,
            0x01 => ResultCode::OkFinish,
            0x02 => ResultCode::ErrSize,
            0x03 => ResultCode::ErrSizeMismatch,
            0x04 => ResultCode::ErrChunk,
            0x05 => ResultCode::ErrBadMagic,
            0x06 => ResultCode::ErrChunkCrc,
            0x07 => ResultCode::ErrBadOffset,
            0x08 => ResultCode::ErrCrcMismatch,
            other => ResultCode::Unknown(other),
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x} ({})", self.as_u8(), self.name())
    }
}

fn read_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}

fn expect_response(frame: &Frame) -> Result<&[u8], ProtocolError> {
    if frame.msg_type != RSP_OTA {
        return Err(ProtocolError::UnexpectedType {
            expected: RSP_OTA,
            got: frame.msg_type,
        });
    }
    if frame.payload.is_empty() {
        return Err(ProtocolError::ShortPayload {
            what: "response",
            len: 0,
            need: 1,
        });
    }
    Ok(&frame.payload)
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartCommand {
    pub slot: u8,
    pub version: u16,
    pub total_size: u32,
    pub image_crc32: u32,
}

impl StartCommand {
    pub const PAYLOAD_LEN: usize = 11;

    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(Self::PAYLOAD_LEN);
        buf.put_u8(self.slot);
        buf.put_u16_le(self.version);
        buf.put_u32_le(self.total_size);
        buf.put_u32_le(self.image_crc32);
        Frame {
            msg_type: CMD_OTA_START,
            payload: buf.freeze(),
        }
    }
}

/// One slice of the image, sent in a single OTA_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u32,
    pub data: Vec<u8>,
    pub chunk_crc32: u32,
}

impl Chunk {
    /// Slice `image` at `offset`, at most `chunk_size` bytes. None at or past the end.
    pub fn slice(image: &[u8], offset: u32, chunk_size: usize) -> Option<Self> {
        let start = offset as usize;
        if start >= image.len() || chunk_size == 0 {
            return None;
        }
        let end = (start + chunk_size).min(image.len());
        let data = image[start..end].to_vec();
        Some(Self {
            offset,
            chunk_crc32: crc32(&data),
            data,
        })
    }

    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset the device should report once this chunk is written.
    pub fn end(&self) -> u32 {
        self.offset + self.len()
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        if self.data.len() + DATA_OVERHEAD > MAX_PAYLOAD {
            return Err(ProtocolError::ChunkTooLarge {
                len: self.data.len(),
                max: MAX_PAYLOAD - DATA_OVERHEAD,
            });
        }
        let mut buf = BytesMut::with_capacity(self.data.len() + DATA_OVERHEAD);
        buf.put_u32_le(self.offset);
        buf.extend_from_slice(&self.data);
        buf.put_u32_le(self.chunk_crc32);
        Ok(Frame {
            msg_type: CMD_OTA_DATA,
            payload: buf.freeze(),
        })
    }
}

// ============================================================================
// Replies
// ============================================================================

/// Reply to OTA_DATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataReply {
    /// Chunk written (or duplicate re-acknowledged).
    Ack {
        next_expected_offset: u32,
        total_size: u32,
    },
    /// Chunk was ahead of the device; resume from this offset.
    BadOffset { resume_offset: u32 },
    /// Any other error code (chunk CRC, out of bounds).
    Error(ResultCode),
}

impl DataReply {
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let payload = expect_response(frame)?;
        match ResultCode::from(payload[0]) {
            ResultCode::OkStart => {
                if payload.len() < 9 {
                    return Err(ProtocolError::ShortPayload {
                        what: "data ack",
                        len: payload.len(),
                        need: 9,
                    });
                }
                Ok(DataReply::Ack {
                    next_expected_offset: read_u32(payload, 1),
                    total_size: read_u32(payload, 5),
                })
            }
            ResultCode::ErrBadOffset => {
                if payload.len() < 5 {
                    return Err(ProtocolError::ShortPayload {
                        what: "bad offset reply",
                        len: payload.len(),
                        need: 5,
                    });
                }
                Ok(DataReply::BadOffset {
                    resume_offset: read_u32(payload, 1),
                })
            }
            code => Ok(DataReply::Error(code)),
        }
    }
}

/// Reply to OTA_FINISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReply {
    /// Image verified; the device reboots into it.
    Ok,
    /// Whole-image CRC mismatch, with the CRC the device computed.
    CrcMismatch { device_crc32: Option<u32> },
    Error(ResultCode),
}

impl FinishReply {
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let payload = expect_response(frame)?;
        Ok(match ResultCode::from(payload[0]) {
            ResultCode::OkFinish => FinishReply::Ok,
            ResultCode::ErrCrcMismatch => FinishReply::CrcMismatch {
                device_crc32: (payload.len() >= 5).then(|| read_u32(payload, 1)),
            },
            code => FinishReply::Error(code),
        })
    }
}

/// Result code of a single-byte reply (START, CONFIRM, REBOOT).
pub fn result_code(frame: &Frame) -> Result<ResultCode, ProtocolError> {
    let payload = expect_response(frame)?;
    Ok(ResultCode::from(payload[0]))
}

/// Asynchronous device -> host notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    EraseProgress { erased: u32 },
    Ready,
}

impl Notification {
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        match frame.msg_type {
            MSG_OTA_PROGRESS => Some(Notification::EraseProgress {
                erased: if frame.payload.len() >= 4 {
                    read_u32(&frame.payload, 0)
                } else {
                    0
                },
            }),
            MSG_OTA_READY => Some(Notification::Ready),
            _ => None,
        }
    }
}

// ============================================================================
// Device status
// ============================================================================

/// Device-side OTA state machine, as reported in OTA_STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    PrepareErase,
    ReadyForData,
    Receiving,
    Verifying,
    PendingReboot,
    TestBoot,
    Error,
    Unknown(u8),
}

impl From<u8> for DeviceState {
    fn from(v: u8) -> Self {
        match v {
            0 => DeviceState::Idle,
            1 => DeviceState::PrepareErase,
            2 => DeviceState::ReadyForData,
            3 => DeviceState::Receiving,
            4 => DeviceState::Verifying,
            5 => DeviceState::PendingReboot,
            6 => DeviceState::TestBoot,
            7 => DeviceState::Error,
            other => DeviceState::Unknown(other),
        }
    }
}

impl DeviceState {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceState::Idle => "idle",
            DeviceState::PrepareErase => "erasing",
            DeviceState::ReadyForData => "ready",
            DeviceState::Receiving => "receiving",
            DeviceState::Verifying => "verifying",
            DeviceState::PendingReboot => "pending_reboot",
            DeviceState::TestBoot => "test_boot",
            DeviceState::Error => "error",
            DeviceState::Unknown(_) => "unknown",
        }
    }
}

/// Reply to OTA_STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub state: DeviceState,
    pub next_expected_offset: u32,
    pub bytes_received: u32,
    pub total_size: u32,
    /// Not reported by legacy firmware.
    pub erase_progress: Option<u32>,
    pub last_error: u8,
    pub active_slot: u8,
    pub pending_slot: u8,
    /// Not reported by legacy firmware.
    pub expected_crc32: Option<u32>,
}

impl DeviceStatus {
    pub const PAYLOAD_LEN: usize = 24;
    pub const LEGACY_PAYLOAD_LEN: usize = 9;

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let p = expect_response(frame)?;
        if p.len() >= Self::PAYLOAD_LEN {
            return Ok(Self {
                state: DeviceState::from(p[0]),
                next_expected_offset: read_u32(p, 1),
                bytes_received: read_u32(p, 5),
                total_size: read_u32(p, 9),
                erase_progress: Some(read_u32(p, 13)),
                last_error: p[17],
                active_slot: p[18],
                pending_slot: p[19],
                expected_crc32: Some(read_u32(p, 20)),
            });
        }
        if p.len() >= Self::LEGACY_PAYLOAD_LEN {
            // Legacy layout: state | bytes_received | total_size
            let bytes_received = read_u32(p, 1);
            return Ok(Self {
                state: DeviceState::from(p[0]),
                next_expected_offset: bytes_received,
                bytes_received,
                total_size: read_u32(p, 5),
                erase_progress: None,
                last_error: 0,
                active_slot: 0,
                pending_slot: 0,
                expected_crc32: None,
            });
        }
        Err(ProtocolError::ShortPayload {
            what: "status",
            len: p.len(),
            need: Self::LEGACY_PAYLOAD_LEN,
        })
    }

    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(Self::PAYLOAD_LEN);
        buf.put_u8(match self.state {
            DeviceState::Idle => 0,
            DeviceState::PrepareErase => 1,
            DeviceState::ReadyForData => 2,
            DeviceState::Receiving => 3,
            DeviceState::Verifying => 4,
            DeviceState::PendingReboot => 5,
            DeviceState::TestBoot => 6,
            DeviceState::Error => 7,
            DeviceState::Unknown(v) => v,
        });
        buf.put_u32_le(self.next_expected_offset);
        buf.put_u32_le(self.bytes_received);
        buf.put_u32_le(self.total_size);
        buf.put_u32_le(self.erase_progress.unwrap_or(0));
        buf.put_u8(self.last_error);
        buf.put_u8(self.active_slot);
        buf.put_u8(self.pending_slot);
        buf.put_u32_le(self.expected_crc32.unwrap_or(0));
        Frame {
            msg_type: RSP_OTA,
            payload: buf.freeze(),
        }
    }
}

/// Build an `RSP_OTA` frame (used by device simulators and tests).
pub fn response_frame(code: ResultCode, extra: &[u8]) -> Frame {
    let mut buf = BytesMut::with_capacity(1 + extra.len());
    buf.put_u8(code.as_u8());
    buf.extend_from_slice(extra);
    Frame {
        msg_type: RSP_OTA,
        payload: buf.freeze(),
    }
}
