// End-to-end session tests: controller, reducer and flow over simulated
// transports.
#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use mblink_api::sim::{SIM_V1_SERIAL, SIM_V2_SERIAL, SimLink, SimPick};
use mblink_api::{
    BoardVersion, DeviceConnectionStatus, DeviceErrorCode, DeviceTransport, UsbTransport,
    device_id_to_microbit_name,
};
use mblink_core::{
    ConnectResult, ConnectionFlowStep, ConnectionFlowType, ConnectionStatus, ConnectionType,
    CoreError, DownloadStep, MicrobitToFlash, SaveToDirectory, SessionConfig, SessionFlags,
};

use common::{
    OTHER_V2_SERIAL, Rig, click_until, connect_bluetooth, connect_radio, program, settle,
    wait_for_status, wait_for_step,
};

// ── Bluetooth flow ──────────────────────────────────────────────────

#[tokio::test]
async fn test_bluetooth_flow_flashes_then_pairs_by_derived_name() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let session = rig.session().await;

    session
        .start_connect_flow(ConnectionFlowType::ConnectBluetooth)
        .await
        .unwrap();
    assert_eq!(session.stage().flow_step, ConnectionFlowStep::Start);

    click_until(&session, ConnectionFlowStep::ConnectBattery).await;
    let name = device_id_to_microbit_name(42);
    assert_eq!(rig.usb.flashed(), vec!["bluetooth".to_owned()]);
    assert_eq!(session.stage().bluetooth_microbit_name, Some(name.clone()));
    assert_eq!(rig.usb.disconnect_count(), 1);
    assert_eq!(*session.subscribe_flash_progress().borrow(), 100);

    click_until(&session, ConnectionFlowStep::None).await;
    wait_for_status(&session, ConnectionStatus::Connected).await;

    assert_eq!(rig.bluetooth.clear_count(), 0);
    assert_eq!(rig.bluetooth.name_filter(), Some(name));
    assert_eq!(
        session.flags().await,
        SessionFlags {
            has_attempted_reconnect: false,
            on_first_connect_attempt: false,
        }
    );
}

#[tokio::test]
async fn test_typed_bluetooth_name_forgets_paired_device() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let session = rig.session().await;
    session
        .start_connect_flow(ConnectionFlowType::ConnectBluetooth)
        .await
        .unwrap();
    click_until(&session, ConnectionFlowStep::EnterBluetoothPattern).await;

    session.set_bluetooth_microbit_name("tapig");
    click_until(&session, ConnectionFlowStep::None).await;
    wait_for_status(&session, ConnectionStatus::Connected).await;

    assert_eq!(rig.bluetooth.clear_count(), 1);
    assert_eq!(rig.bluetooth.name_filter(), Some("tapig".to_owned()));
}

#[tokio::test]
async fn test_first_bluetooth_failure_then_restart() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let session = rig.session().await;
    rig.bluetooth.script(SimLink::Drop);
    session
        .start_connect_flow(ConnectionFlowType::ConnectBluetooth)
        .await
        .unwrap();

    click_until(&session, ConnectionFlowStep::ConnectBluetoothTutorial).await;
    session.on_next_click().await.unwrap();
    wait_for_status(&session, ConnectionStatus::FailedToConnect).await;
    assert_eq!(session.stage().flow_step, ConnectionFlowStep::ConnectFailed);

    session.on_try_again().await.unwrap();
    assert_eq!(session.status(), ConnectionStatus::NotConnected);
    assert_eq!(session.stage().flow_step, ConnectionFlowStep::Start);
    assert_eq!(session.flags().await, SessionFlags::default());
}

#[tokio::test]
async fn test_dismissed_bluetooth_picker_offers_select_again() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let session = rig.session().await;
    rig.bluetooth.script(SimLink::NoDevice);
    session
        .start_connect_flow(ConnectionFlowType::ConnectBluetooth)
        .await
        .unwrap();

    click_until(&session, ConnectionFlowStep::ConnectBluetoothTutorial).await;
    session.on_next_click().await.unwrap();
    wait_for_status(&session, ConnectionStatus::FailedToSelectBluetoothDevice).await;
    assert_eq!(
        session.stage().flow_step,
        ConnectionFlowStep::TryAgainBluetoothSelectMicrobit
    );

    session.on_try_again().await.unwrap();
    assert_eq!(session.stage().flow_step, ConnectionFlowStep::ConnectBluetoothTutorial);
    session.on_next_click().await.unwrap();
    wait_for_status(&session, ConnectionStatus::Connected).await;
}

#[tokio::test]
async fn test_cancelled_usb_picker_offers_select_again() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let session = rig.session().await;
    rig.usb.script_pick(SimPick::Fail(DeviceErrorCode::NoDeviceSelected));
    session
        .start_connect_flow(ConnectionFlowType::ConnectBluetooth)
        .await
        .unwrap();

    click_until(&session, ConnectionFlowStep::TryAgainSelectMicrobit).await;
    session.on_try_again().await.unwrap();

    assert_eq!(session.stage().flow_step, ConnectionFlowStep::ConnectCable);
    assert!(rig.usb.flashed().is_empty());
}

#[tokio::test]
async fn test_concurrent_clicks_are_rejected() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let session = rig.session().await;
    session
        .start_connect_flow(ConnectionFlowType::ConnectBluetooth)
        .await
        .unwrap();
    click_until(&session, ConnectionFlowStep::WebUsbFlashingTutorial).await;

    let (first, second) = tokio::join!(session.on_next_click(), session.on_next_click());

    assert!(first.is_ok());
    assert!(matches!(second, Err(CoreError::Busy)));
    assert_eq!(session.stage().flow_step, ConnectionFlowStep::ConnectBattery);
}

#[tokio::test]
async fn test_invalid_step_action_is_an_error() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let session = rig.session().await;
    session
        .start_connect_flow(ConnectionFlowType::ConnectBluetooth)
        .await
        .unwrap();

    let err = session.on_try_again().await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidStep { .. }), "{err}");
    assert_eq!(session.stage().flow_step, ConnectionFlowStep::Start);
}

// ── Disconnect and reconnect ────────────────────────────────────────

#[tokio::test]
async fn test_explicit_disconnect_is_sticky_until_reconnect() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let session = rig.session().await;
    connect_bluetooth(&session).await;

    session.disconnect().await.unwrap();
    assert_eq!(session.status(), ConnectionStatus::Disconnected);
    rig.bluetooth.set_status(DeviceConnectionStatus::Connected);
    tokio::task::yield_now().await;
    assert_eq!(session.status(), ConnectionStatus::Disconnected);

    session
        .start_connect_flow(ConnectionFlowType::ConnectBluetooth)
        .await
        .unwrap();
    wait_for_status(&session, ConnectionStatus::Connected).await;
    assert_eq!(rig.bluetooth.connect_count(), 2);
    assert_eq!(rig.bluetooth.clear_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_wins_over_racing_transport_event() {
    for _ in 0..32 {
        let rig = Rig::new(&[SIM_V2_SERIAL]);
        let session = rig.session().await;
        connect_bluetooth(&session).await;

        let bluetooth = Arc::clone(&rig.bluetooth);
        let event = tokio::spawn(async move {
            bluetooth.set_status(DeviceConnectionStatus::Reconnecting);
        });
        session.disconnect().await.unwrap();
        event.await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert_eq!(session.status(), ConnectionStatus::Disconnected);
        session.shutdown().await;
    }
}

#[tokio::test]
async fn test_connected_session_just_closes_dialog() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let session = rig.session().await;
    connect_bluetooth(&session).await;

    session
        .start_connect_flow(ConnectionFlowType::ConnectRadioRemote)
        .await
        .unwrap();

    assert_eq!(session.stage().flow_step, ConnectionFlowStep::None);
    assert_eq!(session.connection_type().await, ConnectionType::Bluetooth);
}

#[tokio::test]
async fn test_closing_dialog_before_connecting_tears_down() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let session = rig.session().await;
    session
        .start_connect_flow(ConnectionFlowType::ConnectBluetooth)
        .await
        .unwrap();
    click_until(&session, ConnectionFlowStep::ConnectCable).await;

    session.close_dialog().await;

    assert_eq!(session.stage().flow_step, ConnectionFlowStep::None);
    assert_eq!(session.status(), ConnectionStatus::NotConnected);
    assert_eq!(session.flags().await, SessionFlags::default());
}

// ── Radio flow ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_radio_flow_flashes_remote_then_bridge() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let session = rig.session().await;

    session
        .start_connect_flow(ConnectionFlowType::ConnectRadioRemote)
        .await
        .unwrap();
    click_until(&session, ConnectionFlowStep::ConnectBattery).await;
    let stage = session.stage();
    assert_eq!(stage.flow_type, ConnectionFlowType::ConnectRadioRemote);
    assert_eq!(stage.radio_remote_device_id, Some(42));
    assert_eq!(stage.radio_remote_board_version, Some(BoardVersion::V2));

    session.on_next_click().await.unwrap();
    let stage = session.stage();
    assert_eq!(stage.flow_type, ConnectionFlowType::ConnectRadioBridge);
    assert_eq!(stage.flow_step, ConnectionFlowStep::ConnectCable);

    click_until(&session, ConnectionFlowStep::None).await;
    wait_for_status(&session, ConnectionStatus::Connected).await;
    assert_eq!(
        rig.usb.flashed(),
        vec!["radio-remote".to_owned(), "radio-bridge".to_owned()]
    );
    assert_eq!(rig.bridge.remote(), Some((42, Some(BoardVersion::V2))));
}

#[tokio::test]
async fn test_dev_remote_firmware_is_configurable() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let session = rig
        .session_with(SessionConfig {
            use_dev_radio_remote: true,
            ..SessionConfig::default()
        })
        .await;

    session
        .start_connect_flow(ConnectionFlowType::ConnectRadioRemote)
        .await
        .unwrap();
    click_until(&session, ConnectionFlowStep::ConnectBattery).await;

    assert_eq!(rig.usb.flashed(), vec!["radio-remote-dev".to_owned()]);
}

#[tokio::test]
async fn test_radio_on_v1_is_unsupported_and_switches_to_bluetooth() {
    let rig = Rig::new(&[SIM_V1_SERIAL]);
    let session = rig.session().await;
    session
        .start_connect_flow(ConnectionFlowType::ConnectRadioRemote)
        .await
        .unwrap();

    click_until(&session, ConnectionFlowStep::MicrobitUnsupported).await;
    session.switch_flow_type().await.unwrap();

    let stage = session.stage();
    assert_eq!(stage.flow_type, ConnectionFlowType::ConnectBluetooth);
    assert_eq!(stage.flow_step, ConnectionFlowStep::Start);
    assert_eq!(session.connection_type().await, ConnectionType::Bluetooth);
}

#[tokio::test]
async fn test_bridge_unplug_is_lost_then_failed_twice() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let session = rig.session().await;
    connect_radio(&session).await;

    rig.usb.unplug();
    wait_for_status(&session, ConnectionStatus::ConnectionLost).await;
    let stage = session.stage();
    assert_eq!(stage.flow_step, ConnectionFlowStep::ConnectionLost);
    assert_eq!(stage.flow_type, ConnectionFlowType::ConnectRadioRemote);
    assert!(session.flags().await.has_attempted_reconnect);

    rig.usb.set_status(DeviceConnectionStatus::Disconnected);
    wait_for_status(&session, ConnectionStatus::FailedToReconnectTwice).await;
    wait_for_step(&session, ConnectionFlowStep::ReconnectFailedTwice).await;
    assert_eq!(session.flags().await, SessionFlags::default());
}

#[tokio::test]
async fn test_hidden_tab_bridge_loss_pins_bridge_flow() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let session = rig.session().await;
    connect_radio(&session).await;
    session.set_tab_visible(false).await;

    rig.usb.unplug();
    wait_for_status(&session, ConnectionStatus::ReconnectingAutomatically).await;

    rig.bridge.set_status(DeviceConnectionStatus::NoAuthorizedDevice);
    wait_for_status(&session, ConnectionStatus::ConnectionLost).await;
    assert_eq!(session.stage().flow_type, ConnectionFlowType::ConnectRadioBridge);
}

#[tokio::test]
async fn test_bluetooth_session_ignores_usb_events() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let session = rig.session().await;
    connect_bluetooth(&session).await;

    rig.usb.unplug();
    rig.bluetooth.set_status(DeviceConnectionStatus::Reconnecting);

    wait_for_status(&session, ConnectionStatus::ReconnectingAutomatically).await;
    assert!(!session.flags().await.has_attempted_reconnect);
}

// ── Downloads alongside a session ───────────────────────────────────

#[tokio::test]
async fn test_download_to_own_microbit_does_not_report_loss() {
    let rig = Rig::new(&[SIM_V2_SERIAL, OTHER_V2_SERIAL]);
    let session = rig.session().await;
    connect_radio(&session).await;
    let dir = tempfile::tempdir().unwrap();
    let pipeline = session.download_pipeline(Arc::new(SaveToDirectory::new(dir.path())));
    pipeline.set_show_help(false);
    rig.factory.script_pick(SimPick::Serial(SIM_V2_SERIAL.into()));

    pipeline
        .start(program("wave"), session.download_context().await)
        .await
        .unwrap();
    assert_eq!(pipeline.state().step, DownloadStep::ChooseSameOrDifferentMicrobit);
    pipeline.choose_microbit(MicrobitToFlash::Different).unwrap();
    pipeline.on_next_click().await.unwrap();
    pipeline.on_next_click().await.unwrap();
    assert_eq!(pipeline.state().step, DownloadStep::None);
    settle().await;

    // The session handle lost its device to the temporary one.
    assert_eq!(rig.usb.status(), DeviceConnectionStatus::Disconnected);
    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert!(!session.flags().await.has_attempted_reconnect);

    // Once the download is over, an unplugged bridge is lost again.
    rig.usb.unplug();
    wait_for_status(&session, ConnectionStatus::ConnectionLost).await;
    assert!(session.flags().await.has_attempted_reconnect);
}

#[tokio::test]
async fn test_unplug_after_download_counts_when_session_handle_never_dropped() {
    let rig = Rig::without_usb_claims(&[SIM_V2_SERIAL, OTHER_V2_SERIAL]);
    let session = rig.session().await;
    connect_radio(&session).await;
    let dir = tempfile::tempdir().unwrap();
    let pipeline = session.download_pipeline(Arc::new(SaveToDirectory::new(dir.path())));
    pipeline.set_show_help(false);
    rig.factory.script_pick(SimPick::Serial(SIM_V2_SERIAL.into()));

    pipeline
        .start(program("wave"), session.download_context().await)
        .await
        .unwrap();
    pipeline.choose_microbit(MicrobitToFlash::Different).unwrap();
    pipeline.on_next_click().await.unwrap();
    pipeline.on_next_click().await.unwrap();
    assert_eq!(pipeline.state().step, DownloadStep::None);
    settle().await;
    assert_eq!(session.status(), ConnectionStatus::Connected);

    rig.usb.unplug();
    wait_for_status(&session, ConnectionStatus::ConnectionLost).await;
}

#[tokio::test]
async fn test_download_checks_the_board_the_bluetooth_flow_flashed() {
    let rig = Rig::new(&[SIM_V1_SERIAL, SIM_V2_SERIAL]);
    let session = rig.session().await;
    connect_bluetooth(&session).await;
    assert_eq!(session.stage().bluetooth_board_version, Some(BoardVersion::V1));

    // The main handle now points at another board.
    rig.usb.script_pick(SimPick::Serial(SIM_V2_SERIAL.into()));
    rig.actions.request_usb_connection(None, None).await;
    rig.usb.set_status(DeviceConnectionStatus::Disconnected);
    assert_eq!(rig.usb.board_version(), Some(BoardVersion::V2));

    let dir = tempfile::tempdir().unwrap();
    let pipeline = session.download_pipeline(Arc::new(SaveToDirectory::new(dir.path())));
    pipeline.set_show_help(false);
    let context = session.download_context().await;
    assert_eq!(context.board_version, Some(BoardVersion::V1));

    pipeline.start(program("wave"), context).await.unwrap();
    assert_eq!(pipeline.state().step, DownloadStep::ChooseSameOrDifferentMicrobit);
    pipeline.choose_microbit(MicrobitToFlash::Same).unwrap();
    assert_eq!(pipeline.state().step, DownloadStep::IncompatibleDevice);
}

#[tokio::test]
async fn test_typed_bluetooth_name_forgets_flashed_board() {
    let rig = Rig::new(&[SIM_V1_SERIAL]);
    let session = rig.session().await;
    session
        .start_connect_flow(ConnectionFlowType::ConnectBluetooth)
        .await
        .unwrap();
    click_until(&session, ConnectionFlowStep::ConnectBattery).await;
    assert_eq!(session.stage().bluetooth_board_version, Some(BoardVersion::V1));

    click_until(&session, ConnectionFlowStep::EnterBluetoothPattern).await;
    session.set_bluetooth_microbit_name("tapig");
    assert_eq!(session.stage().bluetooth_board_version, None);
}

#[tokio::test]
async fn test_shutdown_stops_status_pump() {
    let rig = Rig::new(&[SIM_V2_SERIAL]);
    let session = rig.session().await;
    session
        .start_connect_flow(ConnectionFlowType::ConnectBluetooth)
        .await
        .unwrap();

    session.shutdown().await;
    rig.bluetooth.set_status(DeviceConnectionStatus::Connected);
    tokio::task::yield_now().await;

    assert_eq!(session.status(), ConnectionStatus::NotConnected);
    assert_eq!(
        session.reconnect().await.unwrap(),
        ConnectResult::Success,
        "reconnect should still reach the transports after shutdown"
    );
}
