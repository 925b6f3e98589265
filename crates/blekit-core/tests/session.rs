//! Session-level tests against the mock backend.
//!
//! These cover the composite behaviors that cut across modules: the
//! scan-for-connect race, subscription lifecycles, firmware-update
//! single-flight, and the full scan → connect → discover → read → disconnect
//! scenario.

use std::time::Duration;

use blekit_core::{
    BleError, BleErrorCode, BleSession, CharacteristicProperties, DfuEvent, DfuOptions, DfuState,
    Error, FirmwareSource, MockBackend, MockPeripheral, ScanFilter, SubscriptionType, canonicalize,
};
use blekit_types::{Advertisement, Sighting};

/// Let the session's event pump drain anything already broadcast.
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

fn sighting(device_id: &str, services: &[&str], rssi: i16) -> Sighting {
    Sighting {
        device_id: device_id.to_string(),
        name: None,
        advertisement: Advertisement {
            rssi: Some(rssi),
            service_uuids: Some(services.iter().map(|s| canonicalize(s).unwrap()).collect()),
            ..Default::default()
        },
    }
}

fn heart_rate_peripheral() -> MockPeripheral {
    MockPeripheral::new()
        .with_name("Polar H10")
        .with_service("180d")
        .with_characteristic(
            "180d",
            "2a37",
            CharacteristicProperties {
                read: true,
                notify: true,
                ..Default::default()
            },
            Some(vec![0x06, 0x48]),
        )
}

#[tokio::test]
async fn end_to_end_scan_connect_read_disconnect() {
    let backend = MockBackend::new();
    backend.add_peripheral("D1", heart_rate_peripheral()).await;
    let session = BleSession::new(backend.clone());

    // start scan with filter {serviceUUIDs: ["180d"], rssiThreshold: -100}
    let filter = ScanFilter::for_services(["180d"])
        .unwrap()
        .rssi_threshold(-100);
    let mut stream = session.start_scan(filter).await.unwrap();

    backend.emit_sighting(sighting("D1", &["180d"], -60));
    settle().await;

    let record = match stream.recv().await.unwrap() {
        blekit_core::ScanEvent::Sighting(record) => record,
        other => panic!("unexpected scan event: {other:?}"),
    };
    assert_eq!(record.id, "D1");

    session.connect("D1").await.unwrap();
    session.discover_services("D1").await.unwrap();

    let services = session.services("D1").await.unwrap();
    let uuids: Vec<String> = services.iter().map(|s| s.uuid.to_string()).collect();
    assert_eq!(uuids, vec!["0000180d-0000-1000-8000-00805f9b34fb"]);

    let value = session
        .read_characteristic("D1", "180d", "2a37")
        .await
        .unwrap();
    assert_eq!(value, vec![0x06, 0x48]);

    session.disconnect("D1").await.unwrap();
    assert!(!session.is_connected("D1").await);
}

#[tokio::test(start_paused = true)]
async fn find_and_connect_times_out_without_a_sighting() {
    let backend = MockBackend::new();
    let session = BleSession::new(backend.clone());

    let started = tokio::time::Instant::now();
    let result = session
        .find_and_connect("X", Duration::from_millis(50))
        .await;

    assert!(matches!(result, Err(Error::ScanTimeout { .. })));
    // the deadline fires no earlier than the requested 50ms
    assert!(started.elapsed() >= Duration::from_millis(50));
    // and the scan was stopped
    assert!(!session.is_scanning().await);
    assert_eq!(backend.scan_stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn find_and_connect_proceeds_on_first_sighting() {
    let backend = MockBackend::new();
    backend.add_peripheral("X", heart_rate_peripheral()).await;
    let session = BleSession::new(backend.clone());

    let emitter = {
        let backend = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            backend.emit_sighting(sighting("X", &["180d"], -40));
        })
    };

    let started = tokio::time::Instant::now();
    session
        .find_and_connect("X", Duration::from_secs(5))
        .await
        .unwrap();
    emitter.await.unwrap();

    // the match won long before the 5s deadline
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(session.is_connected("X").await);
    assert!(!session.is_scanning().await);
    assert_eq!(backend.connect_calls(), 1);
}

#[tokio::test]
async fn find_and_connect_short_circuits_when_connected() {
    let backend = MockBackend::new();
    backend.add_peripheral("X", heart_rate_peripheral()).await;
    let session = BleSession::new(backend.clone());

    session.connect("X").await.unwrap();
    session
        .find_and_connect("X", Duration::from_millis(10))
        .await
        .unwrap();

    // no scan was started for the second call
    assert_eq!(backend.scan_starts(), 0);
    assert_eq!(backend.connect_calls(), 1);
}

#[tokio::test]
async fn find_and_connect_supersedes_an_active_scan() {
    let backend = MockBackend::new();
    backend.add_peripheral("X", heart_rate_peripheral()).await;
    let session = BleSession::new(backend.clone());

    let mut old_stream = session
        .start_scan(ScanFilter::for_services(["180f"]).unwrap())
        .await
        .unwrap();

    let emitter = {
        let backend = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            backend.emit_sighting(sighting("X", &["180d"], -40));
        })
    };
    session
        .find_and_connect("X", Duration::from_secs(5))
        .await
        .unwrap();
    emitter.await.unwrap();

    // the original scan session ended when it was superseded
    assert!(old_stream.recv().await.is_none());
}

#[tokio::test]
async fn subscription_release_is_idempotent_and_swallows_unsubscribe_failure() {
    let backend = MockBackend::new();
    backend.add_peripheral("D1", heart_rate_peripheral()).await;
    let session = BleSession::new(backend.clone());
    session.connect("D1").await.unwrap();
    session.discover_services("D1").await.unwrap();

    let monitor = session
        .subscribe_to_characteristic("D1", "180d", "2a37", SubscriptionType::Notification)
        .await
        .unwrap();
    assert_eq!(backend.subscribe_calls(), 1);

    // notifications flow while subscribed
    let mut monitor = monitor;
    backend.emit_notification("D1", canonicalize("2a37").unwrap(), vec![0x06, 0x50]);
    assert_eq!(monitor.recv().await.unwrap(), vec![0x06, 0x50]);

    // the best-effort unsubscribe fails, and the failure is not propagated
    backend
        .set_unsubscribe_failure(Some(
            BleError::new(BleErrorCode::CharacteristicNotifyChangeFailed).with_device("D1"),
        ))
        .await;
    monitor.release().await;
    monitor.release().await;
    monitor.release().await;

    // exactly one native unsubscribe despite the repeated releases
    assert_eq!(backend.unsubscribe_calls(), 1);
    assert!(monitor.handle().is_released());
}

#[tokio::test]
async fn subscribe_requires_connection() {
    let backend = MockBackend::new();
    backend.add_peripheral("D1", heart_rate_peripheral()).await;
    let session = BleSession::new(backend.clone());

    let result = session
        .subscribe_to_characteristic("D1", "180d", "2a37", SubscriptionType::Notification)
        .await;
    assert!(matches!(result, Err(Error::NotConnected { .. })));
    assert_eq!(backend.subscribe_calls(), 0);
}

#[tokio::test]
async fn notification_stream_ends_on_disconnect() {
    let backend = MockBackend::new();
    backend.add_peripheral("D1", heart_rate_peripheral()).await;
    let session = BleSession::new(backend.clone());
    session.connect("D1").await.unwrap();
    session.discover_services("D1").await.unwrap();

    let mut monitor = session
        .subscribe_to_characteristic("D1", "180d", "2a37", SubscriptionType::Notification)
        .await
        .unwrap();

    backend.emit_disconnect("D1", None).await;
    settle().await;

    assert!(monitor.recv().await.is_none());
}

#[tokio::test]
async fn dfu_is_single_flight_per_device() {
    let backend = MockBackend::new();
    let session = BleSession::new(backend.clone());

    let _handle = session
        .start_dfu(
            "D1",
            FirmwareSource::application("fw.zip"),
            DfuOptions::default(),
        )
        .await
        .unwrap();
    assert!(session.is_dfu_in_progress("D1").await);

    // a second transfer for the same device is rejected before any native call
    let second = session
        .start_dfu(
            "D1",
            FirmwareSource::application("fw.zip"),
            DfuOptions::default(),
        )
        .await;
    assert!(matches!(second, Err(Error::DfuInProgress { .. })));

    // another device is unaffected
    let _other = session
        .start_dfu(
            "D2",
            FirmwareSource::application("fw.zip"),
            DfuOptions::default(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn dfu_terminal_state_clears_the_active_set() {
    let backend = MockBackend::new();
    let session = BleSession::new(backend.clone());

    let mut handle = session
        .start_dfu(
            "D1",
            FirmwareSource::application("fw.zip"),
            DfuOptions::default(),
        )
        .await
        .unwrap();

    backend
        .emit_dfu_event("D1", DfuEvent::StateChanged(DfuState::Uploading))
        .await;
    backend
        .emit_dfu_event("D1", DfuEvent::StateChanged(DfuState::Completed))
        .await;
    settle().await;

    assert!(!session.is_dfu_in_progress("D1").await);
    assert_eq!(session.dfu_state("D1").await, DfuState::Completed);
    assert!(handle.wait().await.is_ok());

    // the device can start a fresh transfer afterwards
    let _again = session
        .start_dfu(
            "D1",
            FirmwareSource::application("fw2.zip"),
            DfuOptions::default(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn dfu_completion_event_also_clears_the_active_set() {
    let backend = MockBackend::new();
    let session = BleSession::new(backend.clone());

    let mut handle = session
        .start_dfu(
            "D1",
            FirmwareSource::application("fw.zip"),
            DfuOptions::default(),
        )
        .await
        .unwrap();

    // terminal state reached via the explicit completion callback path
    backend.emit_dfu_event("D1", DfuEvent::Completed).await;
    settle().await;

    assert!(!session.is_dfu_in_progress("D1").await);
    assert!(handle.wait().await.is_ok());
}

#[tokio::test]
async fn dfu_failure_surfaces_and_clears() {
    let backend = MockBackend::new();
    let session = BleSession::new(backend.clone());

    let mut handle = session
        .start_dfu(
            "D1",
            FirmwareSource::application("fw.zip"),
            DfuOptions::default(),
        )
        .await
        .unwrap();

    backend
        .emit_dfu_event(
            "D1",
            DfuEvent::Failed(BleError::new(BleErrorCode::OperationFailed).with_device("D1")),
        )
        .await;
    settle().await;

    assert!(matches!(handle.wait().await, Err(Error::Ble(_))));
    assert!(!session.is_dfu_in_progress("D1").await);
    assert_eq!(session.dfu_state("D1").await, DfuState::Error);
}

#[tokio::test]
async fn dfu_native_start_failure_rolls_back() {
    let backend = MockBackend::new();
    backend
        .set_start_dfu_failure(Some(BleError::new(BleErrorCode::OperationStartFailed)))
        .await;
    let session = BleSession::new(backend.clone());

    let result = session
        .start_dfu(
            "D1",
            FirmwareSource::application("fw.zip"),
            DfuOptions::default(),
        )
        .await;

    assert!(matches!(result, Err(Error::Ble(_))));
    assert!(!session.is_dfu_in_progress("D1").await);
    assert_eq!(session.dfu_state("D1").await, DfuState::Error);
}

#[tokio::test]
async fn adapter_state_monitor_delivers_changes() {
    let backend = MockBackend::new();
    let session = BleSession::new(backend.clone());

    let mut monitor = session.monitor_adapter_state();
    backend
        .emit_adapter_state(blekit_types::AdapterState::PoweredOff)
        .await;

    assert_eq!(
        monitor.recv().await.unwrap(),
        blekit_types::AdapterState::PoweredOff
    );
    monitor.release().await;
}

#[tokio::test]
async fn connect_failure_reason_is_surfaced_verbatim() {
    let backend = MockBackend::new();
    backend.add_peripheral("D1", MockPeripheral::new()).await;
    backend
        .set_connect_failure(Some(
            BleError::new(BleErrorCode::DeviceConnectionFailed)
                .with_device("D1")
                .with_reason("link supervision timeout"),
        ))
        .await;
    let session = BleSession::new(backend.clone());

    let err = session.connect("D1").await.unwrap_err();
    assert!(err.to_string().contains("link supervision timeout"));
    assert!(!session.is_connected("D1").await);

    // a later attempt succeeds once the radio recovers
    backend.set_connect_failure(None).await;
    session.connect("D1").await.unwrap();
    assert!(session.is_connected("D1").await);

    session.close().await;
}
