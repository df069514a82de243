//! Integration tests for ScanService
//!
//! These tests run the service over the simulated USB bus and real daemon
//! subprocesses, checking the event stream subscribers would see.

use std::sync::Arc;
use std::time::Duration;
use tagbridge_core::{ReaderEvent, TransportKind};
use tagbridge_hardware::drivers::daemon::{CommandSpec, DaemonConfig};
use tagbridge_hardware::drivers::{ProximityFeed, UsbConfig};
use tagbridge_hardware::mock::{MockUsbBackend, MockUsbHandle};
use tagbridge_hardware::{DeviceManager, ManagerConfig, ReconnectPolicy, TransportSet, UsbReaderId};
use tagbridge_session::{READER_UNAVAILABLE, ScanConfig, ScanService, ServiceHandle};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn manager_config() -> ManagerConfig {
    ManagerConfig {
        poll_interval_ms: 10,
        max_consecutive_failures: 3,
        reconnect: ReconnectPolicy {
            base_delay_ms: 10,
            factor: 2,
            max_delay_ms: 40,
            max_attempts: 2,
        },
    }
}

fn start(
    transports: TransportSet,
) -> (ServiceHandle, mpsc::Receiver<ReaderEvent>, CancellationToken) {
    let manager = DeviceManager::new(manager_config(), transports);
    let (service, handle, events) = ScanService::new(ScanConfig::default(), manager);
    let shutdown = CancellationToken::new();
    tokio::spawn(service.run(shutdown.clone()));
    (handle, events, shutdown)
}

fn usb_transports() -> (TransportSet, MockUsbHandle) {
    let (backend, bus) = MockUsbBackend::new();
    bus.attach(UsbReaderId::new(0x072F, 0x2200).with_product("ACR122U PICC Interface"));
    let transports = TransportSet::new(ProximityFeed::new())
        .with_usb(UsbConfig::default(), Arc::new(backend))
        .without_daemon();
    (transports, bus)
}

fn daemon_transports(poll_script: &str) -> TransportSet {
    let poll = CommandSpec::new("sh", ["-c", poll_script]);
    TransportSet::new(ProximityFeed::new()).with_daemon(DaemonConfig {
        libnfc_probe: CommandSpec::new("sh", ["-c", "echo 'NFC device: nfc-test opened'"]),
        pcsc_probe: CommandSpec::new("tagbridge-no-such-tool", Vec::<String>::new()),
        libnfc_poll: poll.clone(),
        pcsc_poll: poll,
        output: None,
        probe_timeout_ms: 2_000,
        poll_timeout_ms: 2_000,
    })
}

async fn next(events: &mut mpsc::Receiver<ReaderEvent>) -> ReaderEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("Reader event timeout")
        .expect("Event stream closed")
}

#[tokio::test]
async fn test_usb_apdu_read() {
    let (transports, bus) = usb_transports();
    let (handle, mut events, _shutdown) = start(transports);

    let reader = handle.connect_reader().await.unwrap();
    assert_eq!(reader.name(), "ACR122U PICC Interface");
    assert_eq!(
        next(&mut events).await,
        ReaderEvent::ReaderConnected {
            name: "ACR122U PICC Interface".to_string(),
            transport: TransportKind::Usb,
        }
    );

    handle.start_scan().await.unwrap();
    assert!(matches!(next(&mut events).await, ReaderEvent::ScanStarted { .. }));

    bus.push_response(vec![0x04, 0xA1, 0xB2, 0xC3, 0x90, 0x00]);
    let ReaderEvent::CardDetected(read) = next(&mut events).await else {
        panic!("expected card-detected");
    };
    assert_eq!(read.tag_id().as_str(), "04a1b2c3");
    assert_eq!(read.transport(), TransportKind::Usb);
    assert_eq!(next(&mut events).await, ReaderEvent::ScanStopped);
}

#[tokio::test]
async fn test_reader_loss_ends_in_unavailable() {
    let (transports, bus) = usb_transports();
    let (handle, mut events, _shutdown) = start(transports);
    handle.connect_reader().await.unwrap();
    next(&mut events).await;

    handle.start_scan().await.unwrap();
    next(&mut events).await;
    bus.unplug();

    assert_eq!(
        next(&mut events).await,
        ReaderEvent::ReaderDisconnected {
            transport: TransportKind::Usb
        }
    );
    assert_eq!(next(&mut events).await, ReaderEvent::ScanStopped);
    assert_eq!(
        next(&mut events).await,
        ReaderEvent::ReaderUnavailable {
            message: READER_UNAVAILABLE.to_string()
        }
    );

    let status = handle.status().await.unwrap();
    assert!(!status.reader_connected);
    assert!(!status.is_scanning);

    // Only an explicit connect request retries.
    bus.attach(UsbReaderId::new(0x072F, 0x2200));
    assert!(handle.connect_reader().await.is_ok());
    assert!(matches!(
        next(&mut events).await,
        ReaderEvent::ReaderConnected { .. }
    ));
}

#[tokio::test]
async fn test_reader_recovers_after_transient_loss() {
    let (transports, bus) = usb_transports();
    let (handle, mut events, _shutdown) = start(transports);
    handle.connect_reader().await.unwrap();
    next(&mut events).await;

    handle.start_scan().await.unwrap();
    next(&mut events).await;
    bus.unplug();
    bus.attach(UsbReaderId::new(0x072F, 0x2200));

    assert!(matches!(
        next(&mut events).await,
        ReaderEvent::ReaderDisconnected { .. }
    ));
    assert!(matches!(
        next(&mut events).await,
        ReaderEvent::ReaderConnected { .. }
    ));
    assert!(handle.status().await.unwrap().is_scanning);

    bus.present(&[0x04, 0xA1, 0xB2, 0xC3]);
    assert!(matches!(
        next(&mut events).await,
        ReaderEvent::CardDetected(_)
    ));
}

#[tokio::test]
async fn test_daemon_read_after_stop_is_discarded() {
    let transports = daemon_transports("sleep 0.3; echo 'UID: 04A1B2C3'");
    let (handle, mut events, _shutdown) = start(transports);
    handle.connect_reader().await.unwrap();
    next(&mut events).await;

    handle.start_scan().await.unwrap();
    next(&mut events).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.stop_scan().await.unwrap());
    assert_eq!(next(&mut events).await, ReaderEvent::ScanStopped);

    let late = timeout(Duration::from_millis(800), events.recv()).await;
    assert!(late.is_err(), "unexpected event after stop: {late:?}");
}

#[tokio::test]
async fn test_read_started_before_restart_is_not_delivered() {
    let marker = std::env::temp_dir().join(format!("tagbridge-scan-{}", uuid::Uuid::new_v4()));
    let marker = marker.display().to_string();
    let transports = daemon_transports(&format!(
        "if [ -f '{marker}' ]; then sleep 0.3; echo 'UID: 04D4E5F6'; \
         else touch '{marker}'; sleep 0.3; echo 'UID: 04A1B2C3'; fi"
    ));
    let (handle, mut events, _shutdown) = start(transports);
    handle.connect_reader().await.unwrap();
    next(&mut events).await;

    handle.start_scan().await.unwrap();
    assert!(matches!(next(&mut events).await, ReaderEvent::ScanStarted { .. }));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(handle.stop_scan().await.unwrap());
    handle.start_scan().await.unwrap();
    assert_eq!(next(&mut events).await, ReaderEvent::ScanStopped);
    assert!(matches!(next(&mut events).await, ReaderEvent::ScanStarted { .. }));

    let ReaderEvent::CardDetected(read) = next(&mut events).await else {
        panic!("expected card-detected");
    };
    assert_eq!(read.tag_id().as_str(), "04d4e5f6");

    let _ = std::fs::remove_file(&marker);
}

#[tokio::test]
async fn test_daemon_read_end_to_end() {
    let transports = daemon_transports("echo 'UID: 04A1B2C3'");
    let (handle, mut events, shutdown) = start(transports);
    handle.connect_reader().await.unwrap();
    assert!(matches!(
        next(&mut events).await,
        ReaderEvent::ReaderConnected { transport: TransportKind::Daemon, .. }
    ));

    handle.start_scan().await.unwrap();
    next(&mut events).await;

    let ReaderEvent::CardDetected(read) = next(&mut events).await else {
        panic!("expected card-detected");
    };
    assert_eq!(read.tag_id().as_str(), "04a1b2c3");

    shutdown.cancel();
}
