//! Single-attempt transfers: chunking, acks, re-anchoring, retries, abort.

use smartball_protocol::{ResultCode, CMD_OTA_CONFIRM, CMD_OTA_DATA, CMD_OTA_REBOOT};
use smartball_session::{
    query_status, run_attempt, send_command, AbortReason, AttemptOutcome, FailReason,
    ProgressEvent, Session, TransferProfile, TransportKind, TransportPort, BLE_PROFILE,
    SERIAL_PROFILE,
};
use tokio_util::sync::CancellationToken;

use crate::harness::*;

#[tokio::test(start_paused = true)]
async fn test_thousand_bytes_in_eight_chunks() {
    let image = image_of_total(1000);
    let profile = quick(BLE_PROFILE);
    let device = SimDevice::shared(TransportKind::Ble, Faults::default());
    let mut port = SimPort::new(device.clone(), TransportKind::Ble);
    let (progress, mut rx) = progress();

    let session = Session::fresh(&image, &profile, TransportKind::Ble);
    let report = run_attempt(
        &mut port,
        &HANDLE.to_string(),
        session,
        &progress,
        &CancellationToken::new(),
    )
    .await;

    assert!(report.success(), "outcome: {}", report.outcome);
    assert_eq!(report.offset_reached, 1000);
    assert!(!port.is_connected());

    let dev = device.lock().unwrap();
    assert_eq!(dev.count(CMD_OTA_DATA), 8);
    assert_eq!(
        dev.data_offsets,
        vec![0, 128, 256, 384, 512, 640, 768, 896]
    );
    assert_eq!(dev.installed.as_deref(), Some(image.as_bytes()));
    // Stale state cleared before START
    assert_eq!(opcodes_before_first_data(&dev), vec![ABORT, START]);
    assert!(dev.max_unacked <= profile.window_bytes());
    drop(dev);

    let events = drain(&mut rx);
    assert!(events.contains(&ProgressEvent::Ready { fallback: false }));
    assert!(events.contains(&ProgressEvent::Erasing { erased: 1000 }));
    assert!(events.contains(&ProgressEvent::Transferred {
        offset: 1000,
        total_size: 1000
    }));
    assert_eq!(events.last(), Some(&ProgressEvent::Finished));
}

#[tokio::test(start_paused = true)]
async fn test_reassembly_exact_and_partial_multiples() {
    for total in [1024usize, 1000, 129, 14] {
        let image = image_of_total(total);
        let profile = quick(BLE_PROFILE);
        let device = SimDevice::shared(TransportKind::Ble, Faults::default());
        let mut port = SimPort::new(device.clone(), TransportKind::Ble);

        let session = Session::fresh(&image, &profile, TransportKind::Ble);
        let report = run_attempt(
            &mut port,
            &HANDLE.to_string(),
            session,
            &smartball_session::Progress::disabled(),
            &CancellationToken::new(),
        )
        .await;
        assert!(report.success(), "total {total}: {}", report.outcome);

        let dev = device.lock().unwrap();
        assert_eq!(dev.count(CMD_OTA_DATA), total.div_ceil(128), "total {total}");
        assert_eq!(dev.installed.as_deref(), Some(image.as_bytes()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_serial_skips_ready_and_double_aborts() {
    let image = image_of_total(2000);
    let profile = quick(SERIAL_PROFILE);
    let device = SimDevice::shared(TransportKind::Serial, Faults::default());
    let mut port = SimPort::new(device.clone(), TransportKind::Serial);

    let session = Session::fresh(&image, &profile, TransportKind::Serial);
    let report = run_attempt(
        &mut port,
        &"/dev/ttyACM0".to_string(),
        session,
        &smartball_session::Progress::disabled(),
        &CancellationToken::new(),
    )
    .await;
    assert!(report.success());

    let dev = device.lock().unwrap();
    assert_eq!(opcodes_before_first_data(&dev), vec![ABORT, ABORT, START]);
    assert_eq!(dev.data_offsets, vec![0, 480, 960, 1440, 1920]);
    assert!(dev.max_unacked <= profile.window_bytes());
}

#[tokio::test(start_paused = true)]
async fn test_bad_offset_reanchors_without_failing() {
    let image = image_of_total(1000);
    let profile = quick(BLE_PROFILE);
    let faults = Faults {
        rewind_at_offset: Some((384, 256)),
        ..Faults::default()
    };
    let device = SimDevice::shared(TransportKind::Ble, faults);
    let mut port = SimPort::new(device.clone(), TransportKind::Ble);
    let (progress, mut rx) = progress();

    let session = Session::fresh(&image, &profile, TransportKind::Ble);
    let report = run_attempt(
        &mut port,
        &HANDLE.to_string(),
        session,
        &progress,
        &CancellationToken::new(),
    )
    .await;

    assert!(report.success(), "outcome: {}", report.outcome);
    let dev = device.lock().unwrap();
    assert_eq!(
        &dev.data_offsets[..6],
        &[0, 128, 256, 384, 256, 384],
        "chunk at 384 answered with BAD_OFFSET(256)"
    );
    assert_eq!(dev.installed.as_deref(), Some(image.as_bytes()));
    assert!(drain(&mut rx).contains(&ProgressEvent::Reanchored { offset: 256 }));
}

#[tokio::test(start_paused = true)]
async fn test_lost_ack_and_corrupt_chunk_are_retried() {
    let image = image_of_total(1000);
    let profile = quick(BLE_PROFILE);
    let faults = Faults {
        drop_ack_at_offset: Some(128),
        corrupt_at_offset: Some(512),
        ..Faults::default()
    };
    let device = SimDevice::shared(TransportKind::Ble, faults);
    let mut port = SimPort::new(device.clone(), TransportKind::Ble);

    let session = Session::fresh(&image, &profile, TransportKind::Ble);
    let report = run_attempt(
        &mut port,
        &HANDLE.to_string(),
        session,
        &smartball_session::Progress::disabled(),
        &CancellationToken::new(),
    )
    .await;

    assert!(report.success(), "outcome: {}", report.outcome);
    let dev = device.lock().unwrap();
    // 128 re-sent after the ack timeout (duplicate re-ack), 512 re-sent after CRC error
    assert_eq!(
        dev.data_offsets,
        vec![0, 128, 128, 256, 384, 512, 512, 640, 768, 896]
    );
    assert_eq!(dev.installed.as_deref(), Some(image.as_bytes()));
}

#[tokio::test(start_paused = true)]
async fn test_late_ack_costs_one_resend() {
    for kind in [TransportKind::Ble, TransportKind::Serial] {
        let image = image_of_total(1000);
        let profile = TransferProfile {
            chunk_size: 128,
            ..quick(if kind == TransportKind::Ble {
                BLE_PROFILE
            } else {
                SERIAL_PROFILE
            })
        };
        let faults = Faults {
            late_ack_at_offset: Some(128),
            ..Faults::default()
        };
        let device = SimDevice::shared(kind, faults);
        let mut port = SimPort::new(device.clone(), kind);

        let session = Session::fresh(&image, &profile, kind);
        let report = run_attempt(
            &mut port,
            &HANDLE.to_string(),
            session,
            &smartball_session::Progress::disabled(),
            &CancellationToken::new(),
        )
        .await;

        assert!(report.success(), "{kind}: {}", report.outcome);
        let dev = device.lock().unwrap();
        // The late ack answers the resend; the device's duplicate re-ack
        // is dropped when the next chunk goes out
        assert_eq!(
            dev.data_offsets,
            vec![0, 128, 128, 256, 384, 512, 640, 768, 896],
            "{kind}"
        );
        assert_eq!(dev.installed.as_deref(), Some(image.as_bytes()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_legacy_device_without_ready() {
    let image = image_of_total(300);
    let profile = quick(BLE_PROFILE);
    let faults = Faults {
        no_ready: true,
        ..Faults::default()
    };
    let device = SimDevice::shared(TransportKind::Ble, faults);
    let mut port = SimPort::new(device.clone(), TransportKind::Ble);
    let (progress, mut rx) = progress();

    let started = tokio::time::Instant::now();
    let session = Session::fresh(&image, &profile, TransportKind::Ble);
    let report = run_attempt(
        &mut port,
        &HANDLE.to_string(),
        session,
        &progress,
        &CancellationToken::new(),
    )
    .await;

    assert!(report.success());
    assert!(started.elapsed() >= profile.ready_timeout());
    assert!(drain(&mut rx).contains(&ProgressEvent::Ready { fallback: true }));
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_returns_offset() {
    let image = image_of_total(2000);
    let profile = quick(SERIAL_PROFILE);
    let faults = Faults {
        mute_data: true,
        ..Faults::default()
    };
    let device = SimDevice::shared(TransportKind::Serial, faults);
    let mut port = SimPort::new(device.clone(), TransportKind::Serial);

    let session = Session::resume(&image, &profile, TransportKind::Serial, 480);
    let report = run_attempt(
        &mut port,
        &"/dev/ttyACM0".to_string(),
        session,
        &smartball_session::Progress::disabled(),
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(
        report.outcome,
        AttemptOutcome::Failed(FailReason::RetriesExhausted { offset: 480 })
    );
    assert_eq!(report.offset_reached, 480);
    assert!(!port.is_connected());
    let dev = device.lock().unwrap();
    assert_eq!(dev.data_offsets, vec![480; SERIAL_PROFILE.chunk_retries as usize]);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_immediately() {
    let image = image_of_total(1000);
    let profile = quick(BLE_PROFILE);
    let faults = Faults {
        disconnect_at_offset: Some(384),
        ..Faults::default()
    };
    let device = SimDevice::shared(TransportKind::Ble, faults);
    let mut port = SimPort::new(device.clone(), TransportKind::Ble);

    let session = Session::fresh(&image, &profile, TransportKind::Ble);
    let report = run_attempt(
        &mut port,
        &HANDLE.to_string(),
        session,
        &smartball_session::Progress::disabled(),
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(report.outcome, AttemptOutcome::Failed(FailReason::Disconnected));
    assert_eq!(report.offset_reached, 384);
    // No writes after the link died
    assert_eq!(device.lock().unwrap().data_offsets, vec![0, 128, 256, 384]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_sends_abort() {
    let image = image_of_total(1000);
    let profile = quick(BLE_PROFILE);
    let device = SimDevice::shared(TransportKind::Ble, Faults::default());
    let mut port = SimPort::new(device.clone(), TransportKind::Ble);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let session = Session::resume(&image, &profile, TransportKind::Ble, 256);
    let report = run_attempt(
        &mut port,
        &HANDLE.to_string(),
        session,
        &smartball_session::Progress::disabled(),
        &cancel,
    )
    .await;

    assert_eq!(report.outcome, AttemptOutcome::Aborted(AbortReason::Cancelled));
    assert!(report.outcome.is_cancelled());
    let dev = device.lock().unwrap();
    assert_eq!(dev.received, vec![ABORT]);
    assert!(!port.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_finish_crc_mismatch_aborts_attempt() {
    let image = image_of_total(500);
    let profile = quick(BLE_PROFILE);
    let faults = Faults {
        flash_flip_at_offset: Some(128),
        ..Faults::default()
    };
    let device = SimDevice::shared(TransportKind::Ble, faults);
    let mut port = SimPort::new(device.clone(), TransportKind::Ble);

    let session = Session::fresh(&image, &profile, TransportKind::Ble);
    let report = run_attempt(
        &mut port,
        &HANDLE.to_string(),
        session,
        &smartball_session::Progress::disabled(),
        &CancellationToken::new(),
    )
    .await;

    let mut flashed = image.as_bytes().to_vec();
    flashed[128] ^= 0x01;
    match report.outcome {
        AttemptOutcome::Aborted(AbortReason::FinishCrcMismatch { expected, device }) => {
            assert_eq!(expected, image.whole_image_crc32());
            assert_eq!(device, Some(smartball_protocol::crc32(&flashed)));
        }
        other => panic!("unexpected outcome {other}"),
    }
    let dev = device.lock().unwrap();
    assert_eq!(dev.received.last(), Some(&ABORT));
    assert!(dev.installed.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_status_and_commands() {
    let image = image_of_total(1000);
    let profile = quick(BLE_PROFILE);
    let faults = Faults {
        disconnect_at_offset: Some(512),
        ..Faults::default()
    };
    let device = SimDevice::shared(TransportKind::Ble, faults);
    let handle = HANDLE.to_string();

    let mut port = SimPort::new(device.clone(), TransportKind::Ble);
    let session = Session::fresh(&image, &profile, TransportKind::Ble);
    run_attempt(
        &mut port,
        &handle,
        session,
        &smartball_session::Progress::disabled(),
        &CancellationToken::new(),
    )
    .await;

    let mut port = SimPort::new(device.clone(), TransportKind::Ble);
    port.connect(&handle, profile.connect_timeout()).await.unwrap();
    let status = query_status(&mut port, profile.response_timeout())
        .await
        .unwrap();
    assert_eq!(status.next_expected_offset, 512);
    assert_eq!(status.total_size, 1000);
    assert_eq!(status.expected_crc32, Some(image.whole_image_crc32()));

    let code = send_command(&mut port, CMD_OTA_CONFIRM, profile.response_timeout())
        .await
        .unwrap();
    assert_eq!(code, Some(ResultCode::OkStart));
    assert!(device.lock().unwrap().confirmed);

    let none = send_command(&mut port, ABORT, profile.response_timeout())
        .await
        .unwrap();
    assert_eq!(none, None);
    let status = query_status(&mut port, profile.response_timeout())
        .await
        .unwrap();
    assert_eq!(status.total_size, 0);

    let code = send_command(&mut port, CMD_OTA_REBOOT, profile.response_timeout())
        .await
        .unwrap();
    assert_eq!(code, Some(ResultCode::OkStart));
    assert_eq!(device.lock().unwrap().reboots, 1);
}
