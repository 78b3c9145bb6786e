//! Whole upgrades through the resume loop.

use smartball_protocol::CMD_OTA_STATUS;
use smartball_session::{
    ProgressEvent, TransportKind, UpgradeError, Upgrader, BLE_PROFILE, SERIAL_PROFILE,
};
use tokio_util::sync::CancellationToken;

use crate::harness::*;

fn upgrader(
    device: &std::sync::Arc<std::sync::Mutex<SimDevice>>,
    kind: TransportKind,
    progress: smartball_session::Progress,
    cancel: CancellationToken,
) -> Upgrader<SimFactory> {
    let profile = match kind {
        TransportKind::Ble => quick(BLE_PROFILE),
        TransportKind::Serial => quick(SERIAL_PROFILE),
    };
    Upgrader::new(
        SimFactory::new(device.clone(), kind),
        HANDLE.to_string(),
        profile,
        progress,
        cancel,
    )
}

#[tokio::test(start_paused = true)]
async fn test_clean_upgrade_waits_for_reboot() {
    let image = image_of_total(1000);
    let faults = Faults {
        reboot_hidden_polls: 3,
        ..Faults::default()
    };
    let device = SimDevice::shared(TransportKind::Ble, faults);
    let (progress, mut rx) = progress();
    let up = upgrader(&device, TransportKind::Ble, progress, CancellationToken::new());

    let summary = up.run(&image).await.unwrap();
    assert_eq!(summary.attempts, 1);
    assert_eq!(summary.resumed_from, 0);
    assert!(!summary.already_complete);

    let events = drain(&mut rx);
    let awaiting = events
        .iter()
        .position(|e| *e == ProgressEvent::AwaitingReboot)
        .unwrap();
    let rebooted = events
        .iter()
        .position(|e| *e == ProgressEvent::Rebooted)
        .unwrap();
    assert!(awaiting < rebooted);
    assert_eq!(device.lock().unwrap().reboots, 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_resumes_from_device_offset() {
    let image = image_of_total(1000);
    let faults = Faults {
        disconnect_at_offset: Some(384),
        ..Faults::default()
    };
    let device = SimDevice::shared(TransportKind::Ble, faults);
    let (progress, mut rx) = progress();
    let up = upgrader(&device, TransportKind::Ble, progress, CancellationToken::new());

    let summary = up.run(&image).await.unwrap();
    assert_eq!(summary.attempts, 2);
    assert_eq!(summary.resumed_from, 384);

    let dev = device.lock().unwrap();
    // START only once: the resumed session continues the device's context
    assert_eq!(dev.count(START), 1);
    assert_eq!(dev.count(CMD_OTA_STATUS), 1);
    assert_eq!(
        dev.data_offsets,
        vec![0, 128, 256, 384, 384, 512, 640, 768, 896]
    );
    assert_eq!(dev.installed.as_deref(), Some(image.as_bytes()));
    drop(dev);

    let events = drain(&mut rx);
    assert!(events.contains(&ProgressEvent::AttemptFailed {
        offset: 384,
        reason: "failed: disconnected".into(),
    }));
    assert!(events.contains(&ProgressEvent::Resuming { offset: 384 }));
}

#[tokio::test(start_paused = true)]
async fn test_resumed_serial_image_is_byte_identical() {
    let image = image_of_total(3000);
    let faults = Faults {
        disconnect_at_offset: Some(1440),
        ..Faults::default()
    };
    let device = SimDevice::shared(TransportKind::Serial, faults);
    let up = upgrader(
        &device,
        TransportKind::Serial,
        smartball_session::Progress::disabled(),
        CancellationToken::new(),
    );

    let summary = up.run(&image).await.unwrap();
    assert_eq!(summary.resumed_from, 1440);
    let dev = device.lock().unwrap();
    assert_eq!(dev.installed.as_deref(), Some(image.as_bytes()));
    assert!(dev.max_unacked <= SERIAL_PROFILE.window_bytes());
}

#[tokio::test(start_paused = true)]
async fn test_status_complete_counts_as_success() {
    let image = image_of_total(1000);
    let faults = Faults {
        disconnect_on_finish: true,
        ..Faults::default()
    };
    let device = SimDevice::shared(TransportKind::Ble, faults);
    let (progress, mut rx) = progress();
    let up = upgrader(&device, TransportKind::Ble, progress, CancellationToken::new());

    let summary = up.run(&image).await.unwrap();
    assert!(summary.already_complete);
    assert_eq!(summary.attempts, 1);

    let dev = device.lock().unwrap();
    // Nothing re-sent after the status said the image is complete
    assert_eq!(dev.count(START), 1);
    assert_eq!(dev.count(FINISH), 1);
    assert_eq!(dev.data_offsets.len(), 8);
    drop(dev);

    assert!(drain(&mut rx).contains(&ProgressEvent::AlreadyComplete));
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_restarts_from_zero() {
    let image = image_of_total(500);
    let faults = Faults {
        connect_failures: 1,
        ..Faults::default()
    };
    let device = SimDevice::shared(TransportKind::Ble, faults);
    let (progress, mut rx) = progress();
    let up = upgrader(&device, TransportKind::Ble, progress, CancellationToken::new());

    let summary = up.run(&image).await.unwrap();
    assert_eq!(summary.attempts, 2);
    assert_eq!(summary.resumed_from, 0);
    assert!(drain(&mut rx).contains(&ProgressEvent::Restarting));
    assert_eq!(
        device.lock().unwrap().installed.as_deref(),
        Some(image.as_bytes())
    );
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_device_exhausts_attempts() {
    let image = image_of_total(500);
    let faults = Faults {
        silent: true,
        ..Faults::default()
    };
    let device = SimDevice::shared(TransportKind::Ble, faults);
    let up = upgrader(
        &device,
        TransportKind::Ble,
        smartball_session::Progress::disabled(),
        CancellationToken::new(),
    );

    match up.run(&image).await {
        Err(UpgradeError::ResumeAttemptsExhausted {
            attempts,
            last_offset,
            last_error,
        }) => {
            assert_eq!(attempts, BLE_PROFILE.max_attempts);
            assert_eq!(last_offset, 0);
            assert_eq!(last_error, "failed: no reply to start");
        }
        other => panic!("unexpected {other:?}"),
    }
    let dev = device.lock().unwrap();
    assert_eq!(dev.count(START), BLE_PROFILE.max_attempts as usize);
}

#[tokio::test(start_paused = true)]
async fn test_device_that_never_returns_fails_verification() {
    let image = image_of_total(500);
    let faults = Faults {
        never_reappear: true,
        ..Faults::default()
    };
    let device = SimDevice::shared(TransportKind::Ble, faults);
    let up = upgrader(
        &device,
        TransportKind::Ble,
        smartball_session::Progress::disabled(),
        CancellationToken::new(),
    );

    match up.run(&image).await {
        Err(UpgradeError::DeviceDidNotReappear { waited }) => {
            assert_eq!(waited, BLE_PROFILE.reappear_timeout());
        }
        other => panic!("unexpected {other:?}"),
    }
    // The transfer itself completed
    assert!(device.lock().unwrap().installed.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start() {
    let image = image_of_total(500);
    let device = SimDevice::shared(TransportKind::Ble, Faults::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let up = upgrader(
        &device,
        TransportKind::Ble,
        smartball_session::Progress::disabled(),
        cancel,
    );

    assert!(matches!(
        up.run(&image).await,
        Err(UpgradeError::Cancelled { offset: 0 })
    ));
    assert!(device.lock().unwrap().received.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_profile_rejected() {
    let image = image_of_total(500);
    let device = SimDevice::shared(TransportKind::Ble, Faults::default());
    let up = Upgrader::new(
        SimFactory::new(device.clone(), TransportKind::Ble),
        HANDLE.to_string(),
        smartball_session::TransferProfile {
            chunk_size: 0,
            ..BLE_PROFILE
        },
        smartball_session::Progress::disabled(),
        CancellationToken::new(),
    );
    assert!(matches!(
        up.run(&image).await,
        Err(UpgradeError::InvalidProfile(_))
    ));
}
