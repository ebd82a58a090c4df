// Shared rig for the orchestration tests: the core wired to simulated
// transports.
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use mblink_api::HexData;
use mblink_api::sim::{SimBluetooth, SimHexLibrary, SimRadioBridge, SimUsb, SimUsbFactory};
use mblink_core::{
    ConnectActions, ConnectionFlowStep, ConnectionFlowType, ConnectionStatus, SessionConfig,
    SessionController, TransportSupport, Transports,
};

/// A second V2 board (device id 99).
pub const OTHER_V2_SERIAL: &str = "9904360258994e4500000063";

const WAIT: Duration = Duration::from_secs(5);

pub struct Rig {
    pub usb: Arc<SimUsb>,
    pub bluetooth: Arc<SimBluetooth>,
    pub bridge: Arc<SimRadioBridge>,
    pub factory: Arc<SimUsbFactory>,
    pub actions: Arc<ConnectActions>,
}

impl Rig {
    /// Every serial in `plugged` is visible to the main handle and to
    /// temporary handles. A temporary handle selecting the main handle's
    /// board takes it over.
    pub fn new(plugged: &[&str]) -> Self {
        Self::build(plugged, true)
    }

    /// Like [`Rig::new`], but the main handle keeps its board whatever a
    /// temporary handle selects.
    pub fn without_usb_claims(plugged: &[&str]) -> Self {
        Self::build(plugged, false)
    }

    fn build(plugged: &[&str], claims: bool) -> Self {
        let usb = Arc::new(SimUsb::new(plugged.iter().copied()));
        let bluetooth = Arc::new(SimBluetooth::default());
        let bridge = Arc::new(SimRadioBridge::new(Arc::clone(&usb)));
        let mut factory = SimUsbFactory::new(plugged.iter().copied());
        if claims {
            factory = factory.claiming_from(Arc::clone(&usb));
        }
        let factory = Arc::new(factory);
        let transports = Transports {
            usb: usb.clone(),
            bluetooth: bluetooth.clone(),
            radio_bridge: bridge.clone(),
            usb_factory: factory.clone(),
        };
        let actions = Arc::new(ConnectActions::new(transports, Arc::new(SimHexLibrary)));
        Self {
            usb,
            bluetooth,
            bridge,
            factory,
            actions,
        }
    }

    pub async fn session(&self) -> SessionController {
        self.session_with(SessionConfig::default()).await
    }

    pub async fn session_with(&self, config: SessionConfig) -> SessionController {
        let session = SessionController::new(config, Arc::clone(&self.actions), TransportSupport::default());
        session.start().await;
        session
    }
}

pub fn program(name: &str) -> HexData {
    HexData {
        name: name.into(),
        hex: ":020000040000FA\n:00000001FF\n".into(),
    }
}

/// Give the session's background tasks a chance to drain queued events.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub async fn wait_for_status(session: &SessionController, want: ConnectionStatus) {
    let mut rx = session.subscribe_status();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want}, still {}", session.status()))
        .expect("status channel closed");
}

pub async fn wait_for_step(session: &SessionController, want: ConnectionFlowStep) {
    let mut rx = session.subscribe_stage();
    tokio::time::timeout(WAIT, rx.wait_for(|s| s.flow_step == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want}, still {}", session.stage().flow_step))
        .expect("stage channel closed");
}

/// Click "Next" until the stage reaches `want`.
pub async fn click_until(session: &SessionController, want: ConnectionFlowStep) {
    for _ in 0..12 {
        if session.stage().flow_step == want {
            return;
        }
        session.on_next_click().await.unwrap();
    }
    panic!("never reached {want}, stuck at {}", session.stage().flow_step);
}

/// Run the whole Bluetooth flow on a V2 board.
pub async fn connect_bluetooth(session: &SessionController) {
    session
        .start_connect_flow(ConnectionFlowType::ConnectBluetooth)
        .await
        .unwrap();
    click_until(session, ConnectionFlowStep::None).await;
    wait_for_status(session, ConnectionStatus::Connected).await;
}

/// Run the whole radio flow: remote flashed, bridge flashed and linked.
pub async fn connect_radio(session: &SessionController) {
    session
        .start_connect_flow(ConnectionFlowType::ConnectRadioRemote)
        .await
        .unwrap();
    click_until(session, ConnectionFlowStep::None).await;
    wait_for_status(session, ConnectionStatus::Connected).await;
}
