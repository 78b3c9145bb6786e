//! SmartBall OTA -- concrete links and CLI support.
//!
//! The transfer engine lives in `smartball-session`; this crate provides
//! the BLE (Nordic UART over btleplug) and serial (serialport) transports,
//! the TOML configuration, and progress rendering for the CLI.

pub mod ble;
pub mod config;
pub mod report;
pub mod serial;

use std::path::{Path, PathBuf};

use anyhow::Context;
use smartball_protocol::{build_image, crc32, OtaImage, OTA_HEADER_SIZE, OTA_STAGING_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("bluetooth: {0}")]
    Bluetooth(#[from] btleplug::Error),
    #[error("no serial port found (pass --port)")]
    NoSerialPort,
    #[error("image is {size} bytes, the staging slot holds {max}")]
    ImageTooLarge { size: u64, max: u32 },
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Read a raw firmware binary and frame it as an OTA image.
/// Images the device's staging slot cannot hold are refused here.
pub fn load_image(firmware: &Path, version: u16) -> anyhow::Result<OtaImage> {
    let payload =
        std::fs::read(firmware).with_context(|| format!("reading {}", firmware.display()))?;
    let size = (OTA_HEADER_SIZE + payload.len()) as u64;
    if size > u64::from(OTA_STAGING_SIZE) {
        return Err(SetupError::ImageTooLarge {
            size,
            max: OTA_STAGING_SIZE,
        })
        .with_context(|| format!("framing {}", firmware.display()));
    }
    Ok(build_image(&payload, version))
}

/// Frame `firmware` and write the image to `output`.
pub fn write_image_file(firmware: &Path, version: u16, output: &Path) -> anyhow::Result<OtaImage> {
    let image = load_image(firmware, version)?;
    std::fs::write(output, image.as_bytes())
        .with_context(|| format!("writing {}", output.display()))?;
    tracing::info!(
        output = %output.display(),
        total = image.total_size(),
        "image written"
    );
    Ok(image)
}

/// One-line description of an image for the CLI.
pub fn describe_image(image: &OtaImage) -> String {
    format!(
        "{} bytes (payload {} bytes, payload CRC32=0x{:08X}), full CRC32=0x{:08X}, version={}",
        image.total_size(),
        image.payload().len(),
        crc32(image.payload()),
        image.whole_image_crc32(),
        image.version()
    )
}
