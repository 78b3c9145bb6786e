//! Transfer profiles -- every numeric and timing knob of a transfer.
//!
//! None of these are protocol: the state machine reads them, never hardcodes
//! them. Two built-in profiles match what each link tolerates in practice;
//! the CLI config overrides individual fields.

use std::time::Duration;

use smartball_protocol::OTA_CHUNK_MAX;

use crate::UpgradeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProfile {
    // -- Chunking --
    /// Bytes of image per OTA_DATA.
    pub chunk_size: u32,
    /// Unacknowledged bytes allowed ahead of the last ack, in chunks.
    pub window_chunks: u8,
    /// Attempts per chunk before the connection attempt is given up.
    pub chunk_retries: u8,

    // -- Timeouts --
    pub connect_timeout_secs: u64,
    /// Wait for the ack of one OTA_DATA.
    pub chunk_ack_timeout_ms: u64,
    /// Wait for START / STATUS / CONFIRM replies.
    pub response_timeout_ms: u64,
    /// Wait for the FINISH reply (device verifies the whole image first).
    pub finish_timeout_ms: u64,
    /// Deadline for MSG_OTA_READY after START (background erase).
    pub ready_timeout_secs: u64,
    /// Poll granularity inside the READY wait.
    pub ready_poll_ms: u64,

    // -- Pauses --
    /// Best-effort OTA_ABORTs sent before a fresh START.
    pub pre_start_aborts: u8,
    pub pre_start_pause_ms: u64,
    /// Settle time between READY (or its fallback) and the first OTA_DATA.
    pub post_ready_delay_ms: u64,
    pub pre_finish_delay_ms: u64,

    // -- Resume --
    /// Session attempts per upgrade, first one included.
    pub max_attempts: u32,
    /// Pause between a failed attempt and the status query.
    pub resume_delay_secs: u64,
    /// Settle time after FINISH before polling for the rebooted device.
    pub reboot_grace_secs: u64,
    /// Bound on waiting for the rebooted device to reappear.
    pub reappear_timeout_secs: u64,
    /// Per-poll presence scan window.
    pub presence_scan_secs: u64,
}

impl TransferProfile {
    pub const fn window_bytes(&self) -> u32 {
        self.window_chunks as u32 * self.chunk_size
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub const fn chunk_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_ack_timeout_ms)
    }

    pub const fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub const fn finish_timeout(&self) -> Duration {
        Duration::from_millis(self.finish_timeout_ms)
    }

    pub const fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub const fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms)
    }

    pub const fn pre_start_pause(&self) -> Duration {
        Duration::from_millis(self.pre_start_pause_ms)
    }

    pub const fn post_ready_delay(&self) -> Duration {
        Duration::from_millis(self.post_ready_delay_ms)
    }

    pub const fn pre_finish_delay(&self) -> Duration {
        Duration::from_millis(self.pre_finish_delay_ms)
    }

    pub const fn resume_delay(&self) -> Duration {
        Duration::from_secs(self.resume_delay_secs)
    }

    pub const fn reboot_grace(&self) -> Duration {
        Duration::from_secs(self.reboot_grace_secs)
    }

    pub const fn reappear_timeout(&self) -> Duration {
        Duration::from_secs(self.reappear_timeout_secs)
    }

    pub const fn presence_scan(&self) -> Duration {
        Duration::from_secs(self.presence_scan_secs)
    }

    pub fn validate(&self) -> Result<(), UpgradeError> {
        if self.chunk_size == 0 || self.chunk_size as usize > OTA_CHUNK_MAX {
            return Err(UpgradeError::InvalidProfile(format!(
                "chunk_size {} outside 1..={OTA_CHUNK_MAX}",
                self.chunk_size
            )));
        }
        if self.window_chunks == 0 {
            return Err(UpgradeError::InvalidProfile(
                "window_chunks must be at least 1".into(),
            ));
        }
        if self.chunk_retries == 0 {
            return Err(UpgradeError::InvalidProfile(
                "chunk_retries must be at least 1".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(UpgradeError::InvalidProfile(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.ready_poll_ms == 0 {
            return Err(UpgradeError::InvalidProfile(
                "ready_poll_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// BLE (Nordic UART service, write-without-response).
///
/// Small chunks keep every frame inside one notification-sized write.
/// The 90 s READY deadline covers erasing the full 496 KB staging slot.
pub const BLE_PROFILE: TransferProfile = TransferProfile {
    chunk_size: 128,
    window_chunks: 4,
    chunk_retries: 10,

    connect_timeout_secs: 30,
    chunk_ack_timeout_ms: 10_000,
    response_timeout_ms: 8_000,
    finish_timeout_ms: 10_000,
    ready_timeout_secs: 90,
    ready_poll_ms: 2_000,

    pre_start_aborts: 1,
    pre_start_pause_ms: 300,
    post_ready_delay_ms: 1_000,
    pre_finish_delay_ms: 300,

    max_attempts: 5,
    resume_delay_secs: 5,
    reboot_grace_secs: 10,
    reappear_timeout_secs: 60,
    presence_scan_secs: 12,
};

/// Serial (115200 baud, USB CDC).
///
/// The device erases synchronously inside START, so no READY phase.
/// Two ABORTs up front flush whatever a half-finished run left behind.
pub const SERIAL_PROFILE: TransferProfile = TransferProfile {
    chunk_size: 480,
    window_chunks: 1,
    chunk_retries: 3,

    connect_timeout_secs: 10,
    chunk_ack_timeout_ms: 5_000,
    response_timeout_ms: 30_000,
    finish_timeout_ms: 30_000,
    ready_timeout_secs: 0,
    ready_poll_ms: 500,

    pre_start_aborts: 2,
    pre_start_pause_ms: 600,
    post_ready_delay_ms: 0,
    pre_finish_delay_ms: 0,

    max_attempts: 3,
    resume_delay_secs: 2,
    reboot_grace_secs: 2,
    reappear_timeout_secs: 30,
    presence_scan_secs: 2,
};
