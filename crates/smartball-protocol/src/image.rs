//! OTA image framing.
//!
//! Layout (little-endian): magic(4) | version(2) | payload_size(4) | payload_crc32(4) | payload.
//! The device checks the magic after FINISH; the transfer-level CRC sent in
//! OTA_START covers header + payload.

use crate::checksum::{crc32, Crc32Digest};
use crate::{ProtocolError, OTA_HEADER_SIZE, OTA_MAGIC};

/// Parsed image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaImageHeader {
    pub magic: u32,
    pub version: u16,
    pub payload_size: u32,
    pub payload_crc32: u32,
}

impl OtaImageHeader {
    pub fn to_bytes(&self) -> [u8; OTA_HEADER_SIZE] {
        let mut out = [0u8; OTA_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[6..10].copy_from_slice(&self.payload_size.to_le_bytes());
        out[10..14].copy_from_slice(&self.payload_crc32.to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < OTA_HEADER_SIZE {
            return Err(ProtocolError::ShortPayload {
                what: "image header",
                len: bytes.len(),
                need: OTA_HEADER_SIZE,
            });
        }
        Ok(Self {
            magic: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            version: u16::from_le_bytes([bytes[4], bytes[5]]),
            payload_size: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            payload_crc32: u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]),
        })
    }
}

/// A framed image ready for transfer.
#[derive(Debug, Clone)]
pub struct OtaImage {
    pub header: OtaImageHeader,
    /// header ++ payload, exactly what goes over the wire.
    bytes: Vec<u8>,
    /// CRC-32 over `bytes`, sent in OTA_START.
    whole_image_crc32: u32,
}

impl OtaImage {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Total transfer size (header included).
    pub fn total_size(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn whole_image_crc32(&self) -> u32 {
        self.whole_image_crc32
    }

    pub fn version(&self) -> u16 {
        self.header.version
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[OTA_HEADER_SIZE..]
    }
}

/// Wrap a raw firmware payload with the OTA header. Pure; any input is valid.
pub fn build_image(payload: &[u8], version: u16) -> OtaImage {
    let header = OtaImageHeader {
        magic: OTA_MAGIC,
        version,
        payload_size: payload.len() as u32,
        payload_crc32: crc32(payload),
    };

    let mut bytes = Vec::with_capacity(OTA_HEADER_SIZE + payload.len());
    bytes.extend_from_slice(&header.to_bytes());
    bytes.extend_from_slice(payload);

    let mut digest = Crc32Digest::new();
    digest.update(&bytes);
    let whole_image_crc32 = digest.finalize();

    OtaImage {
        header,
        bytes,
        whole_image_crc32,
    }
}
