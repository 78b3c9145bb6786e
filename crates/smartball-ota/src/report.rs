//! Human-readable progress lines on stdout.

use smartball_protocol::DeviceStatus;
use smartball_session::ProgressEvent;

/// Transfer progress is printed once per this many percent.
const PERCENT_STEP: u32 = 5;

/// `[HH:MM:SS] line` in local time.
pub fn timestamped(line: &str) -> String {
    format!("[{}] {line}", chrono::Local::now().format("%H:%M:%S"))
}

/// Turns progress events into lines, thinning out per-chunk updates.
#[derive(Debug, Default)]
pub struct ProgressPrinter {
    last_percent: Option<u32>,
}

impl ProgressPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, event: &ProgressEvent) -> Option<String> {
        let line = match event {
            ProgressEvent::Connecting { target, attempt: 1 } => {
                format!("Connecting to {target}...")
            }
            ProgressEvent::Connecting { target, attempt } => {
                format!("Connecting to {target} (attempt {attempt})...")
            }
            ProgressEvent::Connected { target } => format!("CONNECTED {target}"),
            ProgressEvent::Starting { total_size } => format!("OTA_START ({total_size} bytes)"),
            ProgressEvent::Erasing { erased } => format!("Erasing flash... {erased} bytes"),
            ProgressEvent::Ready { fallback: false } => "READY, sending data".to_string(),
            ProgressEvent::Ready { fallback: true } => {
                "No READY from device, sending data anyway".to_string()
            }
            ProgressEvent::Transferred { offset, total_size } => {
                let percent = percent(*offset, *total_size);
                let due = match self.last_percent {
                    None => true,
                    Some(last) => percent / PERCENT_STEP > last / PERCENT_STEP,
                };
                if !due && offset < total_size {
                    return None;
                }
                self.last_percent = Some(percent);
                format!("Progress {percent}% ({offset}/{total_size})")
            }
            ProgressEvent::Reanchored { offset } => {
                format!("Device expects offset {offset}, realigning")
            }
            ProgressEvent::Finishing => "OTA_FINISH, device verifying image...".to_string(),
            ProgressEvent::Finished => "OTA_FINISH ok, device rebooting".to_string(),
            ProgressEvent::AttemptFailed { offset, reason } => {
                format!("Attempt stopped at offset {offset}: {reason}")
            }
            ProgressEvent::Resuming { offset } => {
                self.last_percent = None;
                format!("Resuming from offset {offset}")
            }
            ProgressEvent::Restarting => {
                self.last_percent = None;
                "Restarting from offset 0".to_string()
            }
            ProgressEvent::AlreadyComplete => "Device already holds the whole image".to_string(),
            ProgressEvent::AwaitingReboot => "Waiting for device to reboot...".to_string(),
            ProgressEvent::Rebooted => "Device back online".to_string(),
        };
        Some(line)
    }
}

fn percent(offset: u32, total: u32) -> u32 {
    if total == 0 {
        return 100;
    }
    (offset as u64 * 100 / total as u64) as u32
}

/// Multi-line dump of an OTA_STATUS reply.
pub fn format_status(status: &DeviceStatus) -> String {
    let mut out = format!(
        "state:          {}\nnext offset:    {}\nreceived:       {}/{} bytes\n",
        status.state.name(),
        status.next_expected_offset,
        status.bytes_received,
        status.total_size
    );
    if let Some(erased) = status.erase_progress {
        out.push_str(&format!("erase progress: {erased}\n"));
    }
    out.push_str(&format!(
        "last error:     {:#04x}\nslots:          active {}, pending {}",
        status.last_error, status.active_slot, status.pending_slot
    ));
    if let Some(crc) = status.expected_crc32 {
        out.push_str(&format!("\nexpected crc:   0x{crc:08X}"));
    }
    out
}
