//! SmartBall Session -- OTA transfer engine.
//!
//! One upgrade = one framed image pushed through a [`TransportPort`]:
//!   START -> (READY wait, BLE) -> DATA chunks -> FINISH
//! with per-chunk retries, BAD_OFFSET re-anchoring, and a resume loop that
//! reconnects, asks the device how far it got, and continues from there.
//!
//! The session itself is a pure state machine ([`session::Session`]); the
//! driver feeds it transport results as events.

pub mod driver;
pub mod profile;
pub mod progress;
pub mod resume;
pub mod session;
pub mod transport;

pub use driver::{query_status, run_attempt, send_command, AttemptOutcome, AttemptReport};
pub use profile::{TransferProfile, BLE_PROFILE, SERIAL_PROFILE};
pub use progress::{Progress, ProgressEvent};
pub use resume::{decide_from_status, ResumeDecision, ResumeManager, UpgradeSummary, Upgrader};
pub use session::{AbortReason, Action, Event, FailReason, Session, SessionState};
pub use transport::{PortFactory, TransportError, TransportKind, TransportPort};

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("invalid transfer profile: {0}")]
    InvalidProfile(String),
    #[error("upgrade cancelled at offset {offset}")]
    Cancelled { offset: u32 },
    #[error("gave up after {attempts} attempts: last offset {last_offset}, last error: {last_error}")]
    ResumeAttemptsExhausted {
        attempts: u32,
        last_offset: u32,
        last_error: String,
    },
    #[error("post-transfer verification failed: device did not come back within {waited:?}")]
    DeviceDidNotReappear { waited: Duration },
}
