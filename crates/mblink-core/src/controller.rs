// ── Session controller ──
//
// Owns one micro:bit connection session: the high-level status, the
// connection dialog's stage and the reducer flags. Transport status
// changes are pumped through the reducer by a background task; user
// actions are sequenced by `flow` and run their transport work here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mblink_api::{
    DeviceConnectionStatus, HexType, StatusChange, TransportKind, device_id_to_microbit_name,
};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::actions::{ConnectActions, HexSource, SameDeviceFn};
use crate::config::SessionConfig;
use crate::download::{DownloadContext, DownloadPipeline, ReleaseFn};
use crate::error::CoreError;
use crate::flow::{self, StepWork, TryAgain};
use crate::manual::ManualDownload;
use crate::model::{
    ConnectResult, ConnectionFlowStep, ConnectionFlowType, ConnectionStage, ConnectionStatus,
    ConnectionType, SessionFlags, TransportSupport,
};
use crate::reducer::{StatusInput, next_status};

// ── In-flight guard ──────────────────────────────────────────────────

/// Held while a user-triggered operation awaits a transport.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ── SessionController ────────────────────────────────────────────────

/// Cheaply cloneable handle to a session.
///
/// Call [`start()`](Self::start) once inside a runtime to begin pumping
/// transport status changes.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<SessionInner>,
}

struct SessionState {
    flags: SessionFlags,
    connection_type: ConnectionType,
    tab_visible: bool,
}

struct SessionInner {
    config: SessionConfig,
    actions: Arc<ConnectActions>,
    support: TransportSupport,
    status: watch::Sender<ConnectionStatus>,
    stage: watch::Sender<ConnectionStage>,
    flash_progress: watch::Sender<u8>,
    state: Mutex<SessionState>,
    busy: AtomicBool,
    /// Set when a download picks the session's own micro:bit, cleared when
    /// its temporary handle is released. Its USB handle drops meanwhile
    /// without the link being lost.
    ignore_next_usb_disconnect: Arc<AtomicBool>,
    status_tx: mpsc::UnboundedSender<StatusChange>,
    status_rx: Mutex<Option<mpsc::UnboundedReceiver<StatusChange>>>,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionController {
    pub fn new(config: SessionConfig, actions: Arc<ConnectActions>, support: TransportSupport) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::NotConnected);
        let (stage, _) = watch::channel(ConnectionStage::default());
        let (flash_progress, _) = watch::channel(0);
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let connection_type = config.default_connection_type;

        Self {
            inner: Arc::new(SessionInner {
                config,
                actions,
                support,
                status,
                stage,
                flash_progress,
                state: Mutex::new(SessionState {
                    flags: SessionFlags::default(),
                    connection_type,
                    tab_visible: true,
                }),
                busy: AtomicBool::new(false),
                ignore_next_usb_disconnect: Arc::new(AtomicBool::new(false)),
                status_tx,
                status_rx: Mutex::new(Some(status_rx)),
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn actions(&self) -> &Arc<ConnectActions> {
        &self.inner.actions
    }

    /// Spawn the status pump. Later calls do nothing.
    pub async fn start(&self) {
        let Some(rx) = self.inner.status_rx.lock().await.take() else {
            return;
        };
        let handle = tokio::spawn(status_pump(
            Arc::clone(&self.inner),
            rx,
            self.inner.cancel.child_token(),
        ));
        self.inner.task_handles.lock().await.push(handle);
        debug!("session started");
    }

    /// Stop background tasks and every transport listener.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.actions.remove_all_listeners();
        let handles: Vec<_> = self.inner.task_handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        debug!("session shut down");
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn stage(&self) -> ConnectionStage {
        self.inner.stage.borrow().clone()
    }

    pub fn subscribe_stage(&self) -> watch::Receiver<ConnectionStage> {
        self.inner.stage.subscribe()
    }

    /// Progress of the current connection-flow flash, 0-100.
    pub fn subscribe_flash_progress(&self) -> watch::Receiver<u8> {
        self.inner.flash_progress.subscribe()
    }

    pub async fn connection_type(&self) -> ConnectionType {
        self.inner.state.lock().await.connection_type
    }

    pub async fn flags(&self) -> SessionFlags {
        self.inner.state.lock().await.flags
    }

    // ── Connection flow ──────────────────────────────────────────────

    /// Open the connection dialog for `flow_type`.
    ///
    /// An established session just closes the dialog; a lost or
    /// disconnected one is reconnected instead of starting over.
    pub async fn start_connect_flow(&self, flow_type: ConnectionFlowType) -> Result<(), CoreError> {
        let status = self.status();
        match status {
            ConnectionStatus::Connected => {
                self.set_step(ConnectionFlowStep::None);
                return Ok(());
            }
            ConnectionStatus::Disconnected
            | ConnectionStatus::ConnectionLost
            | ConnectionStatus::FailedToReconnect => {
                self.reconnect().await?;
                return Ok(());
            }
            ConnectionStatus::Connecting
            | ConnectionStatus::ReconnectingAutomatically
            | ConnectionStatus::ReconnectingExplicitly => {
                error!(%status, "connection dialog opened while a connection is in progress");
                self.inner.set_status(ConnectionStatus::NotConnected).await;
            }
            ConnectionStatus::NotConnected
            | ConnectionStatus::FailedToConnect
            | ConnectionStatus::FailedToReconnectTwice
            | ConnectionStatus::FailedToSelectBluetoothDevice => {}
        }

        let _in_flight = self.inner.begin()?;
        let stage = ConnectionStage::new(flow_type, self.inner.support);
        self.inner.use_connection_type(stage.connection_type(), true).await;
        info!(flow = %stage.flow_type, "connection flow started");
        self.inner.stage.send_replace(stage);
        Ok(())
    }

    pub async fn on_next_click(&self) -> Result<(), CoreError> {
        let _in_flight = self.inner.begin()?;
        let transition = flow::next(&self.stage())?;
        let flow_type = transition.stage.flow_type;
        debug!(step = %transition.stage.flow_step, flow = %flow_type, "next");
        self.inner.stage.send_replace(transition.stage);

        match transition.work {
            None => {}
            Some(StepWork::FlashMicrobit) => self.flash_for_flow(flow_type).await?,
            Some(StepWork::ConnectBluetooth) => self.connect_bluetooth_for_flow().await,
        }
        Ok(())
    }

    pub async fn on_back_click(&self) -> Result<(), CoreError> {
        let _in_flight = self.inner.begin()?;
        let stage = flow::back(&self.stage())?;
        debug!(step = %stage.flow_step, "back");
        self.inner.stage.send_replace(stage);
        Ok(())
    }

    /// Swap between the Bluetooth and radio flows.
    pub async fn switch_flow_type(&self) -> Result<(), CoreError> {
        let _in_flight = self.inner.begin()?;
        let stage = flow::switch_flow_type(&self.stage())?;
        self.inner.use_connection_type(stage.connection_type(), false).await;
        info!(flow = %stage.flow_type, "switched connection flow");
        self.inner.stage.send_replace(stage);
        Ok(())
    }

    pub async fn on_try_again(&self) -> Result<(), CoreError> {
        let _in_flight = self.inner.begin()?;
        match flow::try_again(&self.stage())? {
            TryAgain::Step(stage) => {
                self.inner.stage.send_replace(stage);
            }
            TryAgain::Reconnect => {
                self.reconnect_active().await?;
            }
            TryAgain::Restart(stage) => {
                self.tear_down().await;
                self.inner.use_connection_type(stage.connection_type(), true).await;
                info!(flow = %stage.flow_type, "connection flow restarted");
                self.inner.stage.send_replace(stage);
            }
        }
        Ok(())
    }

    /// Close the connection dialog. A session that never got established
    /// is torn down.
    pub async fn close_dialog(&self) {
        let step = self.stage().flow_step;
        self.set_step(ConnectionFlowStep::None);
        if step == ConnectionFlowStep::None {
            return;
        }
        let status = self.status();
        let established = !matches!(
            status,
            ConnectionStatus::NotConnected
                | ConnectionStatus::Connecting
                | ConnectionStatus::FailedToConnect
                | ConnectionStatus::FailedToReconnectTwice
                | ConnectionStatus::FailedToSelectBluetoothDevice
        );
        if !established {
            debug!(%step, %status, "dialog closed before connecting");
            self.tear_down().await;
        }
    }

    /// Name read from the Bluetooth pattern the user entered.
    ///
    /// A typed name may belong to a different micro:bit than the one last
    /// paired, so the paired device is forgotten before connecting.
    pub fn set_bluetooth_microbit_name(&self, name: impl Into<String>) {
        let name = name.into();
        debug!(%name, "bluetooth name entered");
        self.inner.stage.send_modify(|stage| {
            stage.bluetooth_microbit_name = Some(name);
            stage.bluetooth_board_version = None;
            stage.clear_bluetooth_device = true;
        });
    }

    pub async fn set_tab_visible(&self, visible: bool) {
        self.inner.state.lock().await.tab_visible = visible;
        trace!(visible, "tab visibility");
    }

    // ── Session lifecycle ────────────────────────────────────────────

    /// Explicit user disconnect. Transport events are ignored until
    /// [`reconnect()`](Self::reconnect).
    pub async fn disconnect(&self) -> Result<(), CoreError> {
        let _in_flight = self.inner.begin()?;
        let connection_type = self.connection_type().await;
        self.inner.set_status(ConnectionStatus::Disconnected).await;
        self.inner.actions.remove_status_listener(connection_type);
        self.inner.actions.disconnect(connection_type).await;
        self.set_step(ConnectionFlowStep::None);
        info!(%connection_type, "disconnected");
        Ok(())
    }

    /// Reconnect the session's micro:bit with what the last flow learned.
    pub async fn reconnect(&self) -> Result<ConnectResult, CoreError> {
        let _in_flight = self.inner.begin()?;
        self.reconnect_active().await
    }

    /// A download pipeline sharing this session's transports.
    ///
    /// Picking the session's own micro:bit as the "different" one does not
    /// count as losing the connection. Only the USB disconnect that arrives
    /// while that temporary handle is held is ignored.
    pub fn download_pipeline(&self, manual: Arc<dyn ManualDownload>) -> DownloadPipeline {
        let ignore = Arc::clone(&self.inner.ignore_next_usb_disconnect);
        let on_same_device: SameDeviceFn = Arc::new(move || ignore.store(true, Ordering::Release));
        let ignore = Arc::clone(&self.inner.ignore_next_usb_disconnect);
        let on_released: ReleaseFn = Arc::new(move || {
            if ignore.swap(false, Ordering::AcqRel) {
                debug!("temporary USB handle released before the session handle dropped");
            }
        });
        DownloadPipeline::new(
            Arc::clone(&self.inner.actions),
            manual,
            self.inner.config.show_download_help,
        )
        .with_same_device_callback(on_same_device)
        .with_borrow_release_callback(on_released)
    }

    /// What the download pipeline needs to know about this session.
    ///
    /// The session's micro:bit is the one the last flow flashed, which is
    /// not necessarily the board on the main USB handle.
    pub async fn download_context(&self) -> DownloadContext {
        let connection_type = self.connection_type().await;
        let stage = self.stage();
        let board_version = match connection_type {
            ConnectionType::Bluetooth => stage.bluetooth_board_version,
            ConnectionType::Radio => stage.radio_remote_board_version,
        };
        DownloadContext {
            connection_type,
            connection_status: self.status(),
            board_version,
        }
    }

    // ── Step work ────────────────────────────────────────────────────

    async fn flash_for_flow(&self, flow_type: ConnectionFlowType) -> Result<(), CoreError> {
        let hex_type = match flow_type {
            ConnectionFlowType::ConnectBluetooth => HexType::Bluetooth,
            ConnectionFlowType::ConnectRadioRemote if self.inner.config.use_dev_radio_remote => {
                HexType::RadioRemoteDev
            }
            ConnectionFlowType::ConnectRadioRemote => HexType::RadioRemote,
            ConnectionFlowType::ConnectRadioBridge => HexType::RadioBridge,
        };

        self.inner.flash_progress.send_replace(0);
        let on_progress = |percent: u8| {
            self.inner.flash_progress.send_replace(percent);
            self.inner.stage.send_if_modified(|stage| {
                let changed = stage.flow_step != ConnectionFlowStep::FlashingInProgress;
                stage.flow_step = ConnectionFlowStep::FlashingInProgress;
                changed
            });
        };
        let actions = &self.inner.actions;
        let connection = actions
            .request_usb_connection_and_flash(&HexSource::Firmware(hex_type), &on_progress, None, None)
            .await;

        let mut next = flow::after_flash(&self.stage(), connection.result);
        if connection.result.is_success() {
            let usb = actions.usb();
            match flow_type {
                ConnectionFlowType::ConnectBluetooth => {
                    next.bluetooth_microbit_name = connection.device_id.map(device_id_to_microbit_name);
                    next.bluetooth_board_version = usb.board_version();
                    next.clear_bluetooth_device = false;
                }
                ConnectionFlowType::ConnectRadioRemote => {
                    next.radio_remote_device_id = connection.device_id;
                    next.radio_remote_board_version = usb.board_version();
                }
                ConnectionFlowType::ConnectRadioBridge => {}
            }
            if flow_type != ConnectionFlowType::ConnectRadioBridge {
                // The micro:bit moves to battery power next.
                if let Err(e) = usb.disconnect().await {
                    warn!(error = %e, "releasing USB after flashing failed (non-fatal)");
                }
            }
        }
        info!(%hex_type, result = %connection.result, step = %next.flow_step, "flow flash finished");
        let bridge_next = next.flow_step == ConnectionFlowStep::ConnectingMicrobits;
        self.inner.stage.send_replace(next);

        if bridge_next {
            self.connect_bridge_for_flow().await?;
        }
        Ok(())
    }

    async fn connect_bluetooth_for_flow(&self) {
        let stage = self.stage();
        let result = self
            .inner
            .actions
            .connect_bluetooth(stage.bluetooth_microbit_name.clone(), stage.clear_bluetooth_device)
            .await;
        self.finish_link(result);
    }

    async fn connect_bridge_for_flow(&self) -> Result<(), CoreError> {
        let stage = self.stage();
        let Some(device_id) = stage.radio_remote_device_id else {
            error!("bridge flashed without a remote micro:bit");
            self.set_step(ConnectionFlowStep::ConnectFailed);
            return Err(CoreError::MissingDevice {
                what: "remote micro:bit",
            });
        };
        let result = self
            .inner
            .actions
            .connect_microbits_serial(device_id, stage.radio_remote_board_version)
            .await;
        self.finish_link(result);
        Ok(())
    }

    fn finish_link(&self, result: ConnectResult) {
        let next = flow::after_link(&self.stage(), result);
        info!(%result, step = %next.flow_step, "link attempt finished");
        self.inner.stage.send_replace(next);
    }

    async fn reconnect_active(&self) -> Result<ConnectResult, CoreError> {
        let connection_type = self.connection_type().await;
        let stage = self.stage();
        let remote = stage.radio_remote_device_id;
        if connection_type == ConnectionType::Radio && remote.is_none() {
            return Err(CoreError::MissingDevice {
                what: "remote micro:bit to reconnect",
            });
        }

        self.inner.set_status(ConnectionStatus::ReconnectingExplicitly).await;
        self.inner.use_connection_type(connection_type, false).await;
        info!(%connection_type, "reconnecting");

        let actions = &self.inner.actions;
        let result = match (connection_type, remote) {
            (ConnectionType::Radio, Some(device_id)) => {
                actions
                    .connect_microbits_serial(device_id, stage.radio_remote_board_version)
                    .await
            }
            _ => actions.connect_bluetooth(stage.bluetooth_microbit_name, false).await,
        };
        if result.is_success() {
            self.set_step(ConnectionFlowStep::None);
        } else {
            warn!(%result, "reconnect failed");
        }
        Ok(result)
    }

    /// Disconnect everything the flow touched and start from scratch.
    async fn tear_down(&self) {
        let connection_type = {
            let mut state = self.inner.state.lock().await;
            state.flags.reset();
            self.inner.status.send_replace(ConnectionStatus::NotConnected);
            state.connection_type
        };
        self.inner.actions.disconnect(connection_type).await;
        debug!(%connection_type, "session torn down");
    }

    fn set_step(&self, step: ConnectionFlowStep) {
        self.inner.stage.send_if_modified(|stage| {
            let changed = stage.flow_step != step;
            stage.flow_step = step;
            changed
        });
    }
}

impl SessionInner {
    fn begin(&self) -> Result<InFlight<'_>, CoreError> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(CoreError::Busy);
        }
        Ok(InFlight(&self.busy))
    }

    /// Publish a status decided by the user side. Taking the state lock
    /// orders it with the status pump's read-reduce-publish.
    async fn set_status(&self, status: ConnectionStatus) {
        let _state = self.state.lock().await;
        self.status.send_replace(status);
    }

    /// Make `connection_type` the session's and listen to its transports.
    async fn use_connection_type(&self, connection_type: ConnectionType, reset_flags: bool) {
        {
            let mut state = self.state.lock().await;
            state.connection_type = connection_type;
            if reset_flags {
                state.flags.reset();
            }
        }
        for other in [ConnectionType::Bluetooth, ConnectionType::Radio] {
            if other != connection_type {
                self.actions.remove_status_listener(other);
            }
        }
        self.actions
            .add_status_listener(connection_type, self.status_tx.clone());
    }

    async fn apply_status_change(&self, change: StatusChange) {
        if change.source == TransportKind::Usb
            && change.status == DeviceConnectionStatus::Disconnected
            && self.ignore_next_usb_disconnect.swap(false, Ordering::AcqRel)
        {
            debug!("USB disconnect from a download on the session micro:bit, ignored");
            return;
        }

        let (current, update) = {
            let mut state = self.state.lock().await;
            let current = *self.status.borrow();
            let input = StatusInput {
                connection_type: state.connection_type,
                current,
                device_status: change.status,
                prev_device_status: change.previous,
                source: change.source,
                is_tab_visible: state.tab_visible,
            };
            let update = next_status(&input, &mut state.flags);
            if let Some(update) = update {
                self.status.send_replace(update.status);
                if let Some(step) = flow::step_for_status(update.status) {
                    self.stage.send_modify(|stage| {
                        stage.flow_step = step;
                        stage.flow_type = update.flow_type;
                    });
                }
            }
            (current, update)
        };
        let Some(update) = update else {
            trace!(source = %change.source, status = %change.status, %current, "status change ignored");
            return;
        };

        debug!(
            source = %change.source,
            device_status = %change.status,
            from = %current,
            to = %update.status,
            flow = %update.flow_type,
            "connection status"
        );
    }
}

/// Feed transport status changes through the reducer until cancelled.
async fn status_pump(
    inner: Arc<SessionInner>,
    mut rx: mpsc::UnboundedReceiver<StatusChange>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            change = rx.recv() => match change {
                Some(change) => inner.apply_status_change(change).await,
                None => break,
            },
        }
    }
    debug!("status pump stopped");
}
