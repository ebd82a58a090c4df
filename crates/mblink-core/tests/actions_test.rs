// Integration tests for the connect-actions façade over simulated transports.
#![allow(clippy::unwrap_used)]

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use mblink_api::sim::{SIM_V1_SERIAL, SIM_V2_SERIAL, SimPick};
use mblink_api::{
    AccelerometerData, Button, ButtonEvent, DeviceConnectionStatus, DeviceErrorCode, Error, HexType,
    TransportKind, device_id_to_microbit_name,
};
use mblink_core::{ConnectResult, ConnectionType, HexSource, SameDeviceFn};

use common::{OTHER_V2_SERIAL, Rig, program};

const WAIT: Duration = Duration::from_secs(5);

fn counter() -> (Arc<AtomicU32>, SameDeviceFn) {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);
    (calls, Arc::new(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    }))
}

// ── USB selection ───────────────────────────────────────────────────

#[tokio::test]
async fn test_usb_selection_reports_device_id() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);

    let connection = rig.actions.request_usb_connection(None, None).await;

    assert_eq!(connection.result, ConnectResult::Success);
    assert_eq!(connection.device_id, Some(42));
    assert!(connection.usb.is_some());
}

#[tokio::test]
async fn test_picker_errors_become_results() {
    let cases = [
        (DeviceErrorCode::NoDeviceSelected, ConnectResult::ErrorNoDeviceSelected),
        (
            DeviceErrorCode::UnableToClaimInterface,
            ConnectResult::ErrorUnableToClaimInterface,
        ),
        (DeviceErrorCode::UpdateRequired, ConnectResult::ErrorBadFirmware),
        (DeviceErrorCode::TimeoutError, ConnectResult::Failed),
    ];
    for (code, expected) in cases {
        let rig = Rig::new(&[SIM_V2_SERIAL]);
        rig.usb.script_pick(SimPick::Fail(code));

        let connection = rig.actions.request_usb_connection(None, None).await;

        assert_eq!(connection.result, expected);
        assert_eq!(connection.device_id, None);
        assert!(connection.usb.is_none());
    }
}

#[tokio::test]
async fn test_failed_selection_short_circuits_flashing() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    rig.usb.script_pick(SimPick::Fail(DeviceErrorCode::NoDeviceSelected));

    let connection = rig
        .actions
        .request_usb_connection_and_flash(&HexSource::Firmware(HexType::Bluetooth), &|_: u8| {}, None, None)
        .await;

    assert_eq!(connection.result, ConnectResult::ErrorNoDeviceSelected);
    assert!(rig.usb.flashed().is_empty());
}

// ── Flashing ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_flash_progress_is_monotonic_and_ends_at_100() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let seen = Mutex::new(Vec::new());
    let on_progress = |p: u8| seen.lock().unwrap().push(p);

    let connection = rig
        .actions
        .request_usb_connection_and_flash(&HexSource::Program(program("wave")), &on_progress, None, None)
        .await;

    assert_eq!(connection.result, ConnectResult::Success);
    assert_eq!(rig.usb.flashed(), vec!["wave".to_owned()]);
    let seen = seen.into_inner().unwrap();
    assert_eq!(seen, vec![0, 25, 50, 75, 100]);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_flash_failure_stops_progress_short_of_100() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    rig.usb
        .fail_next_flash(Error::device(DeviceErrorCode::TimeoutError, "usb stalled"));
    let seen = Mutex::new(Vec::new());
    let on_progress = |p: u8| seen.lock().unwrap().push(p);

    let connection = rig
        .actions
        .request_usb_connection_and_flash(&HexSource::Firmware(HexType::Bluetooth), &on_progress, None, None)
        .await;

    assert_eq!(connection.result, ConnectResult::Failed);
    assert_eq!(seen.into_inner().unwrap(), vec![0, 25, 50]);
    assert!(rig.usb.flashed().is_empty());
}

#[tokio::test]
async fn test_radio_firmware_on_v1_is_unsupported() {
    let rig = Rig::new(&[SIM_V1_SERIAL]);

    let connection = rig
        .actions
        .request_usb_connection_and_flash(&HexSource::Firmware(HexType::RadioBridge), &|_: u8| {}, None, None)
        .await;

    assert_eq!(connection.result, ConnectResult::ErrorMicrobitUnsupported);
}

#[tokio::test]
async fn test_bluetooth_firmware_flashes_on_v1() {
    let rig = Rig::new(&[SIM_V1_SERIAL]);

    let connection = rig
        .actions
        .request_usb_connection_and_flash(&HexSource::Firmware(HexType::Bluetooth), &|_: u8| {}, None, None)
        .await;

    assert_eq!(connection.result, ConnectResult::Success);
    assert_eq!(rig.usb.flashed(), vec!["bluetooth".to_owned()]);
}

#[tokio::test]
async fn test_flashing_without_selection_fails() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);

    let result = rig
        .actions
        .flash_microbit(&HexSource::Program(program("x")), &|_: u8| {}, None)
        .await;

    assert_eq!(result, ConnectResult::Failed);
}

// ── Bluetooth ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_known_name_connects_without_clearing_device() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let connection = rig.actions.request_usb_connection(None, None).await;
    let name = device_id_to_microbit_name(connection.device_id.unwrap());

    let result = rig.actions.connect_bluetooth(Some(name.clone()), false).await;

    assert_eq!(result, ConnectResult::Success);
    assert_eq!(rig.bluetooth.clear_count(), 0);
    assert_eq!(rig.bluetooth.connect_count(), 1);
    assert_eq!(rig.bluetooth.name_filter(), Some(name));
}

#[tokio::test]
async fn test_typed_name_clears_paired_device_first() {
    let rig = Rig::new(&[]);

    let result = rig.actions.connect_bluetooth(Some("tapig".into()), true).await;

    assert_eq!(result, ConnectResult::Success);
    assert_eq!(rig.bluetooth.clear_count(), 1);
}

#[tokio::test]
async fn test_dismissed_bluetooth_picker_is_no_device_selected() {
    let rig = Rig::new(&[]);
    rig.bluetooth.script(mblink_api::sim::SimLink::NoDevice);

    let result = rig.actions.connect_bluetooth(None, false).await;

    assert_eq!(result, ConnectResult::ErrorNoDeviceSelected);
}

// ── Radio bridge ────────────────────────────────────────────────────

#[tokio::test]
async fn test_bridge_binds_remote_before_connecting() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    rig.actions.request_usb_connection(None, None).await;

    let result = rig
        .actions
        .connect_microbits_serial(42, Some(mblink_api::BoardVersion::V2))
        .await;

    assert_eq!(result, ConnectResult::Success);
    assert_eq!(rig.bridge.remote(), Some((42, Some(mblink_api::BoardVersion::V2))));
}

// ── Temporary USB handles ───────────────────────────────────────────

#[tokio::test]
async fn test_temporary_handle_hides_session_device_and_reports_same_device_once() {
    let rig = Rig::new(&[SIM_V2_SERIAL, OTHER_V2_SERIAL]);
    rig.actions.request_usb_connection(None, None).await;
    rig.factory.script_pick(SimPick::Serial(SIM_V2_SERIAL.into()));
    let (calls, on_same) = counter();

    let temporary = rig.actions.open_temporary_usb();
    let connection = rig
        .actions
        .request_usb_connection(Some(&temporary), Some(&on_same))
        .await;

    assert_eq!(connection.result, ConnectResult::Success);
    assert_eq!(connection.device_id, Some(42));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.factory.opened()[0].excluded(), vec![SIM_V2_SERIAL.to_owned()]);
}

#[tokio::test]
async fn test_temporary_handle_on_other_device_is_not_same_device() {
    let rig = Rig::new(&[SIM_V2_SERIAL, OTHER_V2_SERIAL]);
    rig.actions.request_usb_connection(None, None).await;
    let (calls, on_same) = counter();

    let temporary = rig.actions.open_temporary_usb();
    let connection = rig
        .actions
        .request_usb_connection(Some(&temporary), Some(&on_same))
        .await;

    assert_eq!(connection.device_id, Some(99));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// ── Listeners ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_sensor_listeners_follow_whichever_link_is_live() {
    let rig = Rig::new(&[]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    rig.actions.add_accelerometer_listener(tx);

    let sample = AccelerometerData { x: 10, y: -20, z: 1024 };
    rig.bluetooth.sensors().publish_accelerometer(sample);
    assert_eq!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap(), Some(sample));

    let sample = AccelerometerData { x: 0, y: 0, z: -1000 };
    rig.bridge.sensors().publish_accelerometer(sample);
    assert_eq!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap(), Some(sample));
}

#[tokio::test]
async fn test_removed_listener_stops_forwarding() {
    let rig = Rig::new(&[]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = rig.actions.add_button_listener(tx);

    let press = ButtonEvent { button: Button::A, state: true };
    rig.bridge.sensors().publish_button(press);
    assert_eq!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap(), Some(press));

    assert!(rig.actions.remove_listener(id));
    assert!(!rig.actions.remove_listener(id));
    assert_eq!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap(), None);
}

#[tokio::test]
async fn test_second_status_listener_replaces_first() {
    let rig = Rig::new(&[]);
    let (first_tx, mut first_rx) = mpsc::unbounded_channel();
    let (second_tx, mut second_rx) = mpsc::unbounded_channel();
    rig.actions.add_status_listener(ConnectionType::Bluetooth, first_tx);
    rig.actions.add_status_listener(ConnectionType::Bluetooth, second_tx);

    rig.bluetooth.set_status(DeviceConnectionStatus::Connected);

    let change = tokio::time::timeout(WAIT, second_rx.recv()).await.unwrap().unwrap();
    assert_eq!(change.source, TransportKind::Bluetooth);
    assert_eq!(change.status, DeviceConnectionStatus::Connected);
    assert_eq!(tokio::time::timeout(WAIT, first_rx.recv()).await.unwrap(), None);
}

#[tokio::test]
async fn test_radio_status_listener_hears_bridge_and_usb() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    rig.actions.add_status_listener(ConnectionType::Radio, tx);

    rig.bridge.set_status(DeviceConnectionStatus::Connected);
    rig.usb.set_status(DeviceConnectionStatus::Disconnected);
    rig.bluetooth.set_status(DeviceConnectionStatus::Connected);

    let mut sources = Vec::new();
    for _ in 0..2 {
        let change = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        sources.push(change.source);
    }
    sources.sort_by_key(ToString::to_string);
    assert_eq!(sources, vec![TransportKind::RadioRemote, TransportKind::Usb]);

    assert!(rig.actions.remove_status_listener(ConnectionType::Radio));
    assert_eq!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap(), None);
}
