//! Resume manager and the top-level upgrade loop.
//!
//! The device is the only source of truth for "how far did we get": after a
//! failed attempt we reconnect, ask OTA_STATUS, and either continue from the
//! reported offset, start over, or accept that the image already landed.
//! No local checkpoint is kept.

use std::time::Duration;

use smartball_protocol::{DeviceState, DeviceStatus, OtaImage};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::driver::{query_status, run_attempt};
use crate::profile::TransferProfile;
use crate::progress::{Progress, ProgressEvent};
use crate::session::Session;
use crate::transport::{PortFactory, TransportPort};
use crate::UpgradeError;

/// Pause between presence polls while waiting out a reboot.
const PRESENCE_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    ResumeFrom(u32),
    TreatComplete,
    RestartFromZero,
}

/// Decide from a status reply (or its absence).
///
/// The device holds "our" transfer only if it is not in its error state and
/// reports our size and, when it says, our whole-image CRC.
pub fn decide_from_status(
    status: Option<&DeviceStatus>,
    last_known_offset: u32,
    total_size: u32,
    image_crc32: u32,
) -> ResumeDecision {
    let Some(status) = status else {
        tracing::info!(last_known_offset, "no status from device, restarting");
        return ResumeDecision::RestartFromZero;
    };

    if status.state == DeviceState::Error {
        tracing::info!(last_error = status.last_error, "device in error state, restarting");
        return ResumeDecision::RestartFromZero;
    }
    if status.total_size != total_size {
        tracing::info!(
            device_total = status.total_size,
            total_size,
            "device holds a different transfer, restarting"
        );
        return ResumeDecision::RestartFromZero;
    }
    if let Some(device_crc) = status.expected_crc32 {
        if device_crc != image_crc32 {
            tracing::info!(
                device_crc = %format!("{device_crc:#010x}"),
                image_crc = %format!("{image_crc32:#010x}"),
                "device expects a different image, restarting"
            );
            return ResumeDecision::RestartFromZero;
        }
    }
    if status.next_expected_offset >= total_size {
        tracing::info!(
            next = status.next_expected_offset,
            total_size,
            "device already holds the whole image"
        );
        return ResumeDecision::TreatComplete;
    }

    if status.next_expected_offset != last_known_offset {
        tracing::debug!(
            device = status.next_expected_offset,
            local = last_known_offset,
            "device offset differs from last acknowledged"
        );
    }
    ResumeDecision::ResumeFrom(status.next_expected_offset)
}

pub struct ResumeManager<'a, F: PortFactory> {
    factory: &'a F,
    handle: &'a <F::Port as TransportPort>::Handle,
    profile: &'a TransferProfile,
    image_crc32: u32,
}

impl<'a, F: PortFactory> ResumeManager<'a, F> {
    pub fn new(
        factory: &'a F,
        handle: &'a <F::Port as TransportPort>::Handle,
        profile: &'a TransferProfile,
        image_crc32: u32,
    ) -> Self {
        Self {
            factory,
            handle,
            profile,
            image_crc32,
        }
    }

    /// Reconnect on a fresh port, query OTA_STATUS, decide.
    pub async fn decide(&self, last_known_offset: u32, total_size: u32) -> ResumeDecision {
        let mut port = self.factory.open();
        let status = match port
            .connect(self.handle, self.profile.connect_timeout())
            .await
        {
            Ok(()) => match query_status(&mut port, self.profile.response_timeout()).await {
                Ok(status) => Some(status),
                Err(e) => {
                    tracing::warn!(error = %e, "status query failed");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "reconnect for status failed");
                None
            }
        };
        port.disconnect().await;

        decide_from_status(
            status.as_ref(),
            last_known_offset,
            total_size,
            self.image_crc32,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeSummary {
    pub attempts: u32,
    pub total_size: u32,
    /// Offset the final, successful attempt started from.
    pub resumed_from: u32,
    /// The device reported the image complete without a local FINISH.
    pub already_complete: bool,
    pub elapsed: Duration,
}

/// Runs attempts until one succeeds or the attempt budget is spent.
pub struct Upgrader<F: PortFactory> {
    factory: F,
    handle: <F::Port as TransportPort>::Handle,
    profile: TransferProfile,
    progress: Progress,
    cancel: CancellationToken,
}

impl<F: PortFactory> Upgrader<F> {
    pub fn new(
        factory: F,
        handle: <F::Port as TransportPort>::Handle,
        profile: TransferProfile,
        progress: Progress,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            factory,
            handle,
            profile,
            progress,
            cancel,
        }
    }

    pub fn profile(&self) -> &TransferProfile {
        &self.profile
    }

    pub async fn run(&self, image: &OtaImage) -> Result<UpgradeSummary, UpgradeError> {
        self.profile.validate()?;

        let started = Instant::now();
        let total = image.total_size();
        let manager = ResumeManager::new(
            &self.factory,
            &self.handle,
            &self.profile,
            image.whole_image_crc32(),
        );

        let mut decision = ResumeDecision::RestartFromZero;
        let mut last_offset = 0u32;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                return Err(UpgradeError::Cancelled {
                    offset: last_offset,
                });
            }

            let mut port = self.factory.open();
            let kind = port.kind();
            let (session, start_offset) = match decision {
                ResumeDecision::ResumeFrom(offset) => {
                    (Session::resume(image, &self.profile, kind, offset), offset)
                }
                _ => (Session::fresh(image, &self.profile, kind), 0),
            };

            tracing::info!(
                attempt,
                max = self.profile.max_attempts,
                start_offset,
                total,
                "starting attempt"
            );
            self.progress.emit(ProgressEvent::Connecting {
                target: self.handle.to_string(),
                attempt,
            });

            let report = run_attempt(&mut port, &self.handle, session, &self.progress, &self.cancel)
                .await;
            drop(port);

            if report.success() {
                self.verify_reboot().await?;
                return Ok(UpgradeSummary {
                    attempts: attempt,
                    total_size: total,
                    resumed_from: start_offset,
                    already_complete: false,
                    elapsed: started.elapsed(),
                });
            }

            last_offset = report.offset_reached;
            if report.outcome.is_cancelled() || self.cancel.is_cancelled() {
                return Err(UpgradeError::Cancelled {
                    offset: last_offset,
                });
            }

            let last_error = report.outcome.to_string();
            tracing::warn!(attempt, offset = last_offset, error = %last_error, "attempt failed");
            self.progress.emit(ProgressEvent::AttemptFailed {
                offset: last_offset,
                reason: last_error.clone(),
            });

            tokio::select! {
                _ = tokio::time::sleep(self.profile.resume_delay()) => {}
                _ = self.cancel.cancelled() => {
                    return Err(UpgradeError::Cancelled { offset: last_offset });
                }
            }

            decision = manager.decide(last_offset, total).await;
            match decision {
                ResumeDecision::TreatComplete => {
                    self.progress.emit(ProgressEvent::AlreadyComplete);
                    self.verify_reboot().await?;
                    return Ok(UpgradeSummary {
                        attempts: attempt,
                        total_size: total,
                        resumed_from: total,
                        already_complete: true,
                        elapsed: started.elapsed(),
                    });
                }
                _ if attempt >= self.profile.max_attempts => {
                    return Err(UpgradeError::ResumeAttemptsExhausted {
                        attempts: attempt,
                        last_offset,
                        last_error,
                    });
                }
                ResumeDecision::ResumeFrom(offset) => {
                    self.progress.emit(ProgressEvent::Resuming { offset });
                }
                ResumeDecision::RestartFromZero => {
                    self.progress.emit(ProgressEvent::Restarting);
                }
            }
        }
    }

    /// Wait for the device to drop off (reboot) and come back.
    async fn verify_reboot(&self) -> Result<(), UpgradeError> {
        self.progress.emit(ProgressEvent::AwaitingReboot);

        let grace_end = Instant::now() + self.profile.reboot_grace();
        let mut dropped = false;
        while Instant::now() < grace_end {
            let scan = self
                .profile
                .presence_scan()
                .min(grace_end.saturating_duration_since(Instant::now()));
            if !self.factory.is_present(&self.handle, scan).await {
                dropped = true;
                break;
            }
            tokio::time::sleep(PRESENCE_POLL).await;
        }
        if !dropped {
            tracing::warn!(
                grace_secs = self.profile.reboot_grace_secs,
                "device never dropped off after upgrade"
            );
        }

        let waited = self.profile.reappear_timeout();
        let deadline = Instant::now() + waited;
        loop {
            let scan = self
                .profile
                .presence_scan()
                .min(deadline.saturating_duration_since(Instant::now()))
                .max(PRESENCE_POLL);
            if self.factory.is_present(&self.handle, scan).await {
                tracing::info!(handle = %self.handle, "device back after reboot");
                self.progress.emit(ProgressEvent::Rebooted);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(UpgradeError::DeviceDidNotReappear { waited });
            }
            tokio::time::sleep(PRESENCE_POLL).await;
        }
    }
}
