//! CRC-32 (reflected 0xEDB88320, init all-ones, final complement).
//!
//! Must match the device firmware bit-for-bit: both the per-chunk CRC and the
//! whole-image CRC are checked on the device side.

use crc::{Crc, Digest, CRC_32_ISO_HDLC};

/// The standard "CRC-32" (ISO-HDLC / zlib / Ethernet) parameter set.
static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Canonical check input and value for this CRC.
pub const CHECK_INPUT: &[u8] = b"123456789";
pub const CHECK_VALUE: u32 = 0xCBF4_3926;

/// CRC-32 of `bytes`.
pub fn crc32(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Self-check against the canonical vector.
///
/// Logs a warning on mismatch but never fails: the caller decides whether to go on.
pub fn verify_crc32_vector() -> bool {
    let got = crc32(CHECK_INPUT);
    if got == CHECK_VALUE {
        tracing::debug!(value = format_args!("{got:#010x}"), "crc32 self-check ok");
        true
    } else {
        tracing::warn!(
            got = format_args!("{got:#010x}"),
            expected = format_args!("{CHECK_VALUE:#010x}"),
            "crc32 self-check mismatch, device will likely reject transfers"
        );
        false
    }
}

/// Incremental CRC-32 over several slices (header then payload, say).
pub struct Crc32Digest {
    inner: Digest<'static, u32>,
}

impl Crc32Digest {
    pub fn new() -> Self {
        Self {
            inner: CRC32.digest(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finalize(self) -> u32 {
        self.inner.finalize()
    }
}

impl Default for Crc32Digest {
    fn default() -> Self {
        Self::new()
    }
}
