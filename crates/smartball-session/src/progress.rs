//! Progress events for the human-facing output.
//!
//! Logs go through `tracing`; these are the few milestones a person watching
//! an upgrade cares about. The CLI prints them, tests collect them.

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Connecting { target: String, attempt: u32 },
    Connected { target: String },
    Starting { total_size: u32 },
    Erasing { erased: u32 },
    Ready { fallback: bool },
    Transferred { offset: u32, total_size: u32 },
    Reanchored { offset: u32 },
    Finishing,
    Finished,
    AttemptFailed { offset: u32, reason: String },
    Resuming { offset: u32 },
    Restarting,
    AlreadyComplete,
    AwaitingReboot,
    Rebooted,
}

/// Cheap, clonable sink. A disabled sink drops everything.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl Progress {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means nobody is watching; not an error
            let _ = tx.send(event);
        }
    }
}
