//! OTA session -- one connection attempt as an explicit state/event table.
//!
//! The session never touches a transport. The driver asks it for the next
//! [`Action`], performs it, and feeds the outcome back as an [`Event`].
//!
//! ```text
//! Idle -> StartSent -> (ReadyWait, BLE) -> Transfer -> FinishSent -> Done
//!                                   any live state -> Aborted | Failed
//! ```

use std::fmt;

use smartball_protocol::{
    Chunk, DataReply, FinishReply, OtaImage, ResultCode, StartCommand, STAGING_SLOT,
};

use crate::profile::TransferProfile;
use crate::transport::TransportKind;

// ============================================================================
// States, reasons, actions, events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    StartSent,
    ReadyWait,
    Transfer,
    FinishSent,
    Done,
    Aborted(AbortReason),
    Failed(FailReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Aborted(_) | SessionState::Failed(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::StartSent => "start_sent",
            SessionState::ReadyWait => "ready_wait",
            SessionState::Transfer => "transfer",
            SessionState::FinishSent => "finish_sent",
            SessionState::Done => "done",
            SessionState::Aborted(_) => "aborted",
            SessionState::Failed(_) => "failed",
        }
    }
}

/// Why a session ended after sending OTA_ABORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Cancelled,
    FinishCrcMismatch {
        expected: u32,
        device: Option<u32>,
    },
    FinishRejected(ResultCode),
    FinishNoReply,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Cancelled => f.write_str("cancelled"),
            AbortReason::FinishCrcMismatch {
                expected,
                device: Some(device),
            } => write!(
                f,
                "image crc mismatch (expected {expected:#010x}, device {device:#010x})"
            ),
            AbortReason::FinishCrcMismatch {
                expected,
                device: None,
            } => write!(f, "image crc mismatch (expected {expected:#010x})"),
            AbortReason::FinishRejected(code) => write!(f, "finish rejected: {code}"),
            AbortReason::FinishNoReply => f.write_str("no reply to finish"),
        }
    }
}

/// Why a session ended without reaching the device's verify step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    StartRejected(ResultCode),
    NoStartReply,
    Disconnected,
    RetriesExhausted { offset: u32 },
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::StartRejected(code) => write!(f, "start rejected: {code}"),
            FailReason::NoStartReply => f.write_str("no reply to start"),
            FailReason::Disconnected => f.write_str("disconnected"),
            FailReason::RetriesExhausted { offset } => {
                write!(f, "chunk at offset {offset} failed after all retries")
            }
        }
    }
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SendStart(StartCommand),
    /// Block on READY / PROGRESS notifications for one poll slice.
    AwaitReady,
    SendChunk(Chunk),
    SendFinish,
    SendAbort,
    Stop,
}

/// What happened to the last action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    StartReply(ResultCode),
    Ready,
    /// The READY deadline passed without a notification.
    ReadyTimeout,
    Data(DataReply),
    Finish(FinishReply),
    /// No reply within the per-request timeout.
    Timeout,
    /// A reply arrived but could not be decoded.
    Malformed,
    Disconnected,
    Cancel,
    AbortSent,
}

// ============================================================================
// Session
// ============================================================================

pub struct Session<'a> {
    image: &'a OtaImage,
    profile: &'a TransferProfile,
    kind: TransportKind,
    state: SessionState,
    last_acked_offset: u32,
    cursor_offset: u32,
    /// Length of the chunk sent at `cursor_offset` and not yet answered.
    in_flight: Option<u32>,
    retries_remaining: u8,
    /// Offset of the last BAD_OFFSET re-anchor, until a chunk is accepted.
    reanchored_to: Option<u32>,
    abort_pending: Option<AbortReason>,
    chunks_sent: u32,
}

impl<'a> Session<'a> {
    /// A session that sends OTA_START and transfers from offset 0.
    pub fn fresh(image: &'a OtaImage, profile: &'a TransferProfile, kind: TransportKind) -> Self {
        Self {
            image,
            profile,
            kind,
            state: SessionState::Idle,
            last_acked_offset: 0,
            cursor_offset: 0,
            in_flight: None,
            retries_remaining: profile.chunk_retries,
            reanchored_to: None,
            abort_pending: None,
            chunks_sent: 0,
        }
    }

    /// A session continuing a device-side transfer. START would reset the
    /// device's receive context, so it is skipped.
    pub fn resume(
        image: &'a OtaImage,
        profile: &'a TransferProfile,
        kind: TransportKind,
        offset: u32,
    ) -> Self {
        let offset = offset.min(image.total_size());
        Self {
            state: SessionState::Transfer,
            last_acked_offset: offset,
            cursor_offset: offset,
            ..Self::fresh(image, profile, kind)
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn profile(&self) -> &TransferProfile {
        self.profile
    }

    pub fn last_acked_offset(&self) -> u32 {
        self.last_acked_offset
    }

    pub fn cursor_offset(&self) -> u32 {
        self.cursor_offset
    }

    pub fn total_size(&self) -> u32 {
        self.image.total_size()
    }

    pub fn retries_remaining(&self) -> u8 {
        self.retries_remaining
    }

    pub fn chunks_sent(&self) -> u32 {
        self.chunks_sent
    }

    /// Bytes sent but not yet acknowledged.
    pub fn outstanding_bytes(&self) -> u32 {
        self.cursor_offset - self.last_acked_offset + self.in_flight.unwrap_or(0)
    }

    /// Whether this session opens with OTA_START.
    pub fn sends_start(&self) -> bool {
        self.state == SessionState::Idle
    }

    /// Next request to perform. Sending actions are recorded as outstanding;
    /// asking again before feeding an event repeats the request.
    pub fn next_action(&mut self) -> Action {
        if self.state.is_terminal() {
            return Action::Stop;
        }
        if self.abort_pending.is_some() {
            return Action::SendAbort;
        }

        match self.state {
            SessionState::Idle | SessionState::StartSent => {
                self.transition(SessionState::StartSent);
                Action::SendStart(StartCommand {
                    slot: STAGING_SLOT,
                    version: self.image.version(),
                    total_size: self.image.total_size(),
                    image_crc32: self.image.whole_image_crc32(),
                })
            }
            SessionState::ReadyWait => Action::AwaitReady,
            SessionState::Transfer | SessionState::FinishSent => {
                if self.cursor_offset >= self.image.total_size() {
                    self.transition(SessionState::FinishSent);
                    return Action::SendFinish;
                }
                match Chunk::slice(
                    self.image.as_bytes(),
                    self.cursor_offset,
                    self.profile.chunk_size as usize,
                ) {
                    Some(chunk) => {
                        debug_assert!(
                            self.cursor_offset + chunk.len()
                                <= self.last_acked_offset + self.profile.window_bytes()
                        );
                        self.in_flight = Some(chunk.len());
                        self.chunks_sent += 1;
                        Action::SendChunk(chunk)
                    }
                    None => {
                        self.transition(SessionState::FinishSent);
                        Action::SendFinish
                    }
                }
            }
            SessionState::Done | SessionState::Aborted(_) | SessionState::Failed(_) => {
                Action::Stop
            }
        }
    }

    pub fn on_event(&mut self, event: Event) {
        if self.state.is_terminal() {
            tracing::debug!(state = self.state.name(), ?event, "event after terminal state");
            return;
        }

        match (self.state, event) {
            // -- Abort bookkeeping --
            (_, Event::Cancel) => {
                tracing::info!(offset = self.last_acked_offset, "session cancelled");
                self.abort_pending = Some(AbortReason::Cancelled);
            }
            (_, Event::AbortSent) => {
                let reason = self.abort_pending.unwrap_or(AbortReason::Cancelled);
                self.transition(SessionState::Aborted(reason));
            }
            (_, Event::Disconnected) => {
                match self.abort_pending {
                    Some(reason) => self.transition(SessionState::Aborted(reason)),
                    None => self.transition(SessionState::Failed(FailReason::Disconnected)),
                }
                self.in_flight = None;
            }

            // -- START --
            (SessionState::StartSent, Event::StartReply(ResultCode::OkStart)) => {
                if self.kind.awaits_ready() {
                    self.transition(SessionState::ReadyWait);
                } else {
                    self.transition(SessionState::Transfer);
                }
            }
            (SessionState::StartSent, Event::StartReply(code)) => {
                self.transition(SessionState::Failed(FailReason::StartRejected(code)));
            }
            (SessionState::StartSent, Event::Timeout | Event::Malformed) => {
                self.transition(SessionState::Failed(FailReason::NoStartReply));
            }

            // -- READY --
            (SessionState::ReadyWait, Event::Ready) => {
                self.transition(SessionState::Transfer);
            }
            (SessionState::ReadyWait, Event::ReadyTimeout) => {
                tracing::warn!(
                    deadline_secs = self.profile.ready_timeout_secs,
                    "no READY from device, proceeding with transfer"
                );
                self.transition(SessionState::Transfer);
            }
            (SessionState::ReadyWait, Event::StartReply(code)) if code != ResultCode::OkStart => {
                self.transition(SessionState::Failed(FailReason::StartRejected(code)));
            }

            // -- DATA --
            (SessionState::Transfer, Event::Data(reply)) => self.on_data_reply(reply),
            (SessionState::Transfer, Event::Timeout | Event::Malformed) => {
                self.chunk_attempt_failed("no usable reply");
            }

            // -- FINISH --
            (SessionState::FinishSent, Event::Finish(FinishReply::Ok)) => {
                self.transition(SessionState::Done);
            }
            (
                SessionState::FinishSent,
                Event::Finish(FinishReply::CrcMismatch { device_crc32 }),
            ) => {
                self.abort_pending = Some(AbortReason::FinishCrcMismatch {
                    expected: self.image.whole_image_crc32(),
                    device: device_crc32,
                });
            }
            (SessionState::FinishSent, Event::Finish(FinishReply::Error(code))) => {
                self.abort_pending = Some(AbortReason::FinishRejected(code));
            }
            (SessionState::FinishSent, Event::Timeout | Event::Malformed) => {
                self.abort_pending = Some(AbortReason::FinishNoReply);
            }

            (state, event) => {
                tracing::debug!(state = state.name(), ?event, "event ignored in this state");
            }
        }
    }

    fn on_data_reply(&mut self, reply: DataReply) {
        let Some(len) = self.in_flight else {
            tracing::debug!(?reply, "data reply with no chunk in flight");
            return;
        };
        let total = self.image.total_size();

        match reply {
            DataReply::Ack {
                next_expected_offset,
                total_size,
            } if total_size == total && next_expected_offset == self.cursor_offset + len => {
                self.accept(next_expected_offset);
            }
            // The device re-acks a chunk it already holds with the chunk's own offset
            DataReply::Ack {
                next_expected_offset,
                total_size,
            } if total_size == total && next_expected_offset == self.cursor_offset => {
                tracing::debug!(offset = self.cursor_offset, "duplicate chunk re-acknowledged");
                self.accept(self.cursor_offset + len);
            }
            DataReply::Ack {
                next_expected_offset,
                total_size,
            } => {
                tracing::debug!(
                    offset = self.cursor_offset,
                    next_expected_offset,
                    total_size,
                    "stale acknowledgment"
                );
                self.chunk_attempt_failed("stale acknowledgment");
            }
            DataReply::BadOffset { resume_offset } if resume_offset <= total => {
                let repeated = self.reanchored_to == Some(resume_offset);
                self.in_flight = None;
                self.cursor_offset = resume_offset;
                self.last_acked_offset = resume_offset;
                if repeated {
                    // No chunk landed since the last re-anchor to this offset
                    self.chunk_attempt_failed("repeated re-anchor");
                } else {
                    tracing::info!(to = resume_offset, "device requested re-anchor");
                    self.reanchored_to = Some(resume_offset);
                    self.retries_remaining = self.profile.chunk_retries;
                }
            }
            DataReply::BadOffset { resume_offset } => {
                tracing::warn!(resume_offset, total, "re-anchor offset beyond image");
                self.chunk_attempt_failed("re-anchor beyond image");
            }
            DataReply::Error(code) => {
                tracing::warn!(offset = self.cursor_offset, %code, "chunk rejected");
                self.chunk_attempt_failed("chunk rejected");
            }
        }
    }

    fn accept(&mut self, next: u32) {
        self.in_flight = None;
        self.reanchored_to = None;
        self.cursor_offset = next;
        self.last_acked_offset = next;
        self.retries_remaining = self.profile.chunk_retries;
    }

    fn chunk_attempt_failed(&mut self, why: &'static str) {
        self.in_flight = None;
        self.retries_remaining = self.retries_remaining.saturating_sub(1);
        if self.retries_remaining == 0 {
            tracing::warn!(offset = self.cursor_offset, why, "chunk retries exhausted");
            self.transition(SessionState::Failed(FailReason::RetriesExhausted {
                offset: self.cursor_offset,
            }));
        } else {
            tracing::debug!(
                offset = self.cursor_offset,
                why,
                retries_left = self.retries_remaining,
                "retrying chunk"
            );
        }
    }

    fn transition(&mut self, to: SessionState) {
        if self.state != to {
            tracing::debug!(from = self.state.name(), to = to.name(), "session transition");
            self.state = to;
        }
    }
}
