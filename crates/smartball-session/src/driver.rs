//! Attempt driver -- runs one [`Session`] against one [`TransportPort`].
//!
//! Transport errors stop here: whatever happens, the caller gets an
//! [`AttemptReport`] with the offset the device acknowledged, and the port
//! has been told to disconnect.

use std::fmt;

use smartball_protocol::{
    result_code, DataReply, DeviceStatus, FinishReply, Frame, Notification, ResultCode,
    CMD_OTA_ABORT, CMD_OTA_FINISH, CMD_OTA_STATUS, MSG_OTA_PROGRESS, MSG_OTA_READY, RSP_OTA,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::progress::{Progress, ProgressEvent};
use crate::session::{AbortReason, Action, Event, FailReason, Session, SessionState};
use crate::transport::{TransportError, TransportPort};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Done,
    Aborted(AbortReason),
    Failed(FailReason),
    ConnectFailed(String),
}

impl AttemptOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AttemptOutcome::Aborted(AbortReason::Cancelled))
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Done => f.write_str("done"),
            AttemptOutcome::Aborted(reason) => write!(f, "aborted: {reason}"),
            AttemptOutcome::Failed(reason) => write!(f, "failed: {reason}"),
            AttemptOutcome::ConnectFailed(err) => write!(f, "connect failed: {err}"),
        }
    }
}

/// Result of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub outcome: AttemptOutcome,
    /// Highest offset the device acknowledged during this attempt.
    pub offset_reached: u32,
}

impl AttemptReport {
    pub fn success(&self) -> bool {
        self.outcome == AttemptOutcome::Done
    }
}

/// Connect, drive `session` to a terminal state, disconnect.
pub async fn run_attempt<P: TransportPort>(
    port: &mut P,
    handle: &P::Handle,
    mut session: Session<'_>,
    progress: &Progress,
    cancel: &CancellationToken,
) -> AttemptReport {
    let profile = *session.profile();

    tracing::info!(
        transport = %port.kind(),
        %handle,
        offset = session.last_acked_offset(),
        total = session.total_size(),
        "connecting"
    );
    if let Err(e) = port.connect(handle, profile.connect_timeout()).await {
        tracing::warn!(%handle, error = %e, "connect failed");
        port.disconnect().await;
        return AttemptReport {
            outcome: AttemptOutcome::ConnectFailed(e.to_string()),
            offset_reached: session.last_acked_offset(),
        };
    }
    progress.emit(ProgressEvent::Connected {
        target: handle.to_string(),
    });

    drive(port, &mut session, progress, cancel).await;
    port.disconnect().await;

    let outcome = match session.state() {
        SessionState::Done => AttemptOutcome::Done,
        SessionState::Aborted(reason) => AttemptOutcome::Aborted(reason),
        SessionState::Failed(reason) => AttemptOutcome::Failed(reason),
        other => {
            // drive() only returns on a terminal state
            tracing::error!(state = other.name(), "attempt ended in a live state");
            AttemptOutcome::Failed(FailReason::Disconnected)
        }
    };
    tracing::info!(
        %outcome,
        offset = session.last_acked_offset(),
        chunks = session.chunks_sent(),
        "attempt finished"
    );
    AttemptReport {
        outcome,
        offset_reached: session.last_acked_offset(),
    }
}

async fn drive<P: TransportPort>(
    port: &mut P,
    session: &mut Session<'_>,
    progress: &Progress,
    cancel: &CancellationToken,
) {
    let profile = *session.profile();
    let total = session.total_size();

    if session.sends_start() {
        // Clear whatever a previous run left on the device
        for _ in 0..profile.pre_start_aborts {
            if let Err(e) = port.send(&Frame::command(CMD_OTA_ABORT)).await {
                if e.is_fatal_to_link() {
                    session.on_event(Event::Disconnected);
                    return;
                }
            }
            tokio::time::sleep(profile.pre_start_pause()).await;
        }
        progress.emit(ProgressEvent::Starting { total_size: total });
    }

    let mut cancel_seen = false;
    let mut ready_deadline: Option<Instant> = None;

    loop {
        if !cancel_seen && cancel.is_cancelled() {
            cancel_seen = true;
            session.on_event(Event::Cancel);
        }

        match session.next_action() {
            Action::SendStart(cmd) => {
                let event = match port
                    .send_and_wait(&cmd.to_frame(), &[RSP_OTA], profile.response_timeout())
                    .await
                {
                    Ok(frame) => match result_code(&frame) {
                        Ok(code) => Event::StartReply(code),
                        Err(e) => {
                            tracing::warn!(error = %e, "unreadable start reply");
                            Event::Malformed
                        }
                    },
                    Err(e) => transport_event(&e),
                };
                session.on_event(event);
                match session.state() {
                    SessionState::ReadyWait => {
                        ready_deadline = Some(Instant::now() + profile.ready_timeout());
                    }
                    SessionState::Transfer => {
                        tokio::time::sleep(profile.post_ready_delay()).await;
                    }
                    _ => {}
                }
            }

            Action::AwaitReady => {
                let deadline =
                    *ready_deadline.get_or_insert_with(|| Instant::now() + profile.ready_timeout());
                let now = Instant::now();
                if now >= deadline {
                    session.on_event(Event::ReadyTimeout);
                    progress.emit(ProgressEvent::Ready { fallback: true });
                    tokio::time::sleep(profile.post_ready_delay()).await;
                    continue;
                }

                let slice = profile.ready_poll().min(deadline - now);
                match port
                    .recv(&[MSG_OTA_READY, MSG_OTA_PROGRESS, RSP_OTA], slice)
                    .await
                {
                    Ok(frame) => match Notification::from_frame(&frame) {
                        Some(Notification::Ready) => {
                            session.on_event(Event::Ready);
                            progress.emit(ProgressEvent::Ready { fallback: false });
                            tokio::time::sleep(profile.post_ready_delay()).await;
                        }
                        Some(Notification::EraseProgress { erased }) => {
                            tracing::debug!(erased, "erase progress");
                            progress.emit(ProgressEvent::Erasing { erased });
                        }
                        None => {
                            if let Ok(code) = result_code(&frame) {
                                session.on_event(Event::StartReply(code));
                            }
                        }
                    },
                    Err(TransportError::Timeout(_)) => {}
                    Err(e) => session.on_event(transport_event(&e)),
                }
            }

            Action::SendChunk(chunk) => {
                let frame = match chunk.to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!(offset = chunk.offset, error = %e, "cannot encode chunk");
                        session.on_event(Event::Malformed);
                        continue;
                    }
                };
                tracing::trace!(
                    offset = chunk.offset,
                    len = chunk.len(),
                    frame = %hex::encode(&frame.payload[..frame.payload.len().min(16)]),
                    "sending chunk"
                );

                let before = session.last_acked_offset();
                let event = match port
                    .send_and_wait(&frame, &[RSP_OTA], profile.chunk_ack_timeout())
                    .await
                {
                    Ok(reply) => match DataReply::from_frame(&reply) {
                        Ok(reply) => Event::Data(reply),
                        Err(e) => {
                            tracing::debug!(error = %e, "unreadable data reply");
                            Event::Malformed
                        }
                    },
                    Err(e) => transport_event(&e),
                };
                session.on_event(event);

                let after = session.last_acked_offset();
                if let Event::Data(DataReply::BadOffset { .. }) = event {
                    if session.state() == SessionState::Transfer {
                        progress.emit(ProgressEvent::Reanchored { offset: after });
                    }
                } else if after > before {
                    progress.emit(ProgressEvent::Transferred {
                        offset: after,
                        total_size: total,
                    });
                }
            }

            Action::SendFinish => {
                progress.emit(ProgressEvent::Finishing);
                tokio::time::sleep(profile.pre_finish_delay()).await;
                let event = match port
                    .send_and_wait(
                        &Frame::command(CMD_OTA_FINISH),
                        &[RSP_OTA],
                        profile.finish_timeout(),
                    )
                    .await
                {
                    Ok(frame) => match FinishReply::from_frame(&frame) {
                        Ok(reply) => Event::Finish(reply),
                        Err(e) => {
                            tracing::warn!(error = %e, "unreadable finish reply");
                            Event::Malformed
                        }
                    },
                    Err(e) => transport_event(&e),
                };
                session.on_event(event);
                if session.state() == SessionState::Done {
                    progress.emit(ProgressEvent::Finished);
                }
            }

            Action::SendAbort => {
                // The device acknowledges ABORT with an empty frame; never awaited
                let event = match port.send(&Frame::command(CMD_OTA_ABORT)).await {
                    Ok(()) => Event::AbortSent,
                    Err(e) => transport_event(&e),
                };
                session.on_event(event);
            }

            Action::Stop => return,
        }
    }
}

fn transport_event(err: &TransportError) -> Event {
    match err {
        TransportError::Timeout(_) => Event::Timeout,
        other if other.is_fatal_to_link() => {
            tracing::warn!(error = %other, "link lost");
            Event::Disconnected
        }
        _ => Event::Malformed,
    }
}

/// Query OTA_STATUS on a connected port.
pub async fn query_status<P: TransportPort>(
    port: &mut P,
    timeout: std::time::Duration,
) -> Result<DeviceStatus, TransportError> {
    let frame = port
        .send_and_wait(&Frame::command(CMD_OTA_STATUS), &[RSP_OTA], timeout)
        .await?;
    let status = DeviceStatus::from_frame(&frame)?;
    tracing::debug!(
        state = status.state.name(),
        next = status.next_expected_offset,
        total = status.total_size,
        "device status"
    );
    Ok(status)
}

/// Send an argument-less command on a connected port and return its result
/// code. OTA_ABORT is fire-and-forget and yields `None`.
pub async fn send_command<P: TransportPort>(
    port: &mut P,
    opcode: u8,
    timeout: std::time::Duration,
) -> Result<Option<ResultCode>, TransportError> {
    let frame = Frame::command(opcode);
    if opcode == CMD_OTA_ABORT {
        port.send(&frame).await?;
        return Ok(None);
    }
    let reply = port.send_and_wait(&frame, &[RSP_OTA], timeout).await?;
    Ok(Some(result_code(&reply)?))
}
