//! Configuration types for smartball-ota.
//! Parsed from ~/.smartball/ota.toml.
//!
//! Every field is optional. Transfer knobs left unset fall through to the
//! built-in profile of the link in use (`BLE_PROFILE` / `SERIAL_PROFILE`).

use serde::{Deserialize, Serialize};
use smartball_session::{TransferProfile, TransportKind, BLE_PROFILE, SERIAL_PROFILE};
use std::path::Path;
use std::time::Duration;

use crate::ble::{BleSettings, BleTarget};
use crate::serial::SerialSettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OtaConfig {
    #[serde(default)]
    pub ble: BleSection,
    #[serde(default)]
    pub serial: SerialSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub resume: ResumeSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSection {
    /// Matched as a substring of the advertised local name.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Takes precedence over `device_name` when set.
    pub address: Option<String>,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_chunk_gap_ms")]
    pub chunk_gap_ms: u64,
    pub chunk_size: Option<u32>,
    pub window_chunks: Option<u8>,
    pub chunk_retries: Option<u8>,
}

impl Default for BleSection {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            address: None,
            settle_ms: default_settle_ms(),
            chunk_gap_ms: default_chunk_gap_ms(),
            chunk_size: None,
            window_chunks: None,
            chunk_retries: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSection {
    /// Auto-detected when unset.
    pub port: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    /// Boards that reset on DTR need this long to boot after the port opens.
    #[serde(default = "default_boot_wait_ms")]
    pub boot_wait_ms: u64,
    pub chunk_size: Option<u32>,
    pub chunk_retries: Option<u8>,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            port: None,
            baud: default_baud(),
            pacing_ms: default_pacing_ms(),
            boot_wait_ms: default_boot_wait_ms(),
            chunk_size: None,
            chunk_retries: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSection {
    pub connect_timeout_secs: Option<u64>,
    pub chunk_ack_timeout_ms: Option<u64>,
    pub response_timeout_ms: Option<u64>,
    pub finish_timeout_ms: Option<u64>,
    pub ready_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeSection {
    pub max_attempts: Option<u32>,
    pub resume_delay_secs: Option<u64>,
    pub reboot_grace_secs: Option<u64>,
    pub reappear_timeout_secs: Option<u64>,
}

// Default value functions
fn default_device_name() -> String {
    "SmartBall".into()
}
fn default_settle_ms() -> u64 {
    1500
}
fn default_chunk_gap_ms() -> u64 {
    20
}
fn default_baud() -> u32 {
    crate::serial::DEFAULT_BAUD
}
fn default_pacing_ms() -> u64 {
    crate::serial::CHUNK_PACING.as_millis() as u64
}
fn default_boot_wait_ms() -> u64 {
    4000
}

impl OtaConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: OtaConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Built-in profile for `kind` with the configured overrides applied.
    pub fn profile_for(&self, kind: TransportKind) -> TransferProfile {
        let mut p = match kind {
            TransportKind::Ble => {
                let mut p = BLE_PROFILE;
                override_with(&mut p.chunk_size, self.ble.chunk_size);
                override_with(&mut p.window_chunks, self.ble.window_chunks);
                override_with(&mut p.chunk_retries, self.ble.chunk_retries);
                p
            }
            TransportKind::Serial => {
                let mut p = SERIAL_PROFILE;
                override_with(&mut p.chunk_size, self.serial.chunk_size);
                override_with(&mut p.chunk_retries, self.serial.chunk_retries);
                p
            }
        };

        let s = &self.session;
        override_with(&mut p.connect_timeout_secs, s.connect_timeout_secs);
        override_with(&mut p.chunk_ack_timeout_ms, s.chunk_ack_timeout_ms);
        override_with(&mut p.response_timeout_ms, s.response_timeout_ms);
        override_with(&mut p.finish_timeout_ms, s.finish_timeout_ms);
        override_with(&mut p.ready_timeout_secs, s.ready_timeout_secs);

        let r = &self.resume;
        override_with(&mut p.max_attempts, r.max_attempts);
        override_with(&mut p.resume_delay_secs, r.resume_delay_secs);
        override_with(&mut p.reboot_grace_secs, r.reboot_grace_secs);
        override_with(&mut p.reappear_timeout_secs, r.reappear_timeout_secs);
        p
    }

    /// CLI flags win over the config file.
    pub fn ble_target(&self, name: Option<&str>, address: Option<&str>) -> BleTarget {
        if let Some(address) = address.or(self.ble.address.as_deref()) {
            return BleTarget::Address(address.to_string());
        }
        BleTarget::Name(name.unwrap_or(&self.ble.device_name).to_string())
    }

    pub fn ble_settings(&self) -> BleSettings {
        BleSettings {
            settle: Duration::from_millis(self.ble.settle_ms),
            chunk_gap: Duration::from_millis(self.ble.chunk_gap_ms),
        }
    }

    /// `no_reset` skips the boot wait for boards that do not reset on open.
    pub fn serial_settings(&self, no_reset: bool) -> SerialSettings {
        SerialSettings {
            baud: self.serial.baud,
            pacing: Duration::from_millis(self.serial.pacing_ms),
            boot_wait: if no_reset {
                Duration::ZERO
            } else {
                Duration::from_millis(self.serial.boot_wait_ms)
            },
        }
    }
}

fn override_with<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}
