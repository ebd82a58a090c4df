//! In-memory simulated transports.
//!
//! Scriptable stand-ins for the USB, Bluetooth and radio-bridge transports.
//! Each one owns a real [`StatusPublisher`], so everything downstream of the
//! trait boundary runs unchanged. Used by the `mblink simulate` command and
//! by the orchestration tests.
//!
//! Connect attempts consume a queue of scripted outcomes; when the queue is
//! empty the attempt succeeds.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::board::{BoardVersion, device_id_from_serial};
use crate::error::{DeviceErrorCode, Error};
use crate::hex::{FlashDataSource, HexLibrary, HexType, resolve_hex_url};
use crate::sensor::{AccelerometerData, ButtonEvent, SensorHub};
use crate::status::{DeviceConnectionStatus, StatusChange, StatusPublisher, TransportKind};
use crate::transport::{
    BluetoothTransport, DeviceTransport, ProgressFn, RadioBridgeTransport, SensorSource,
    UsbSelectionOptions, UsbTransport, UsbTransportFactory,
};

/// Serial number of a simulated V2 board (device id 42).
pub const SIM_V2_SERIAL: &str = "9904360258994e450000002a";
/// Serial number of a simulated V1 board (device id 7).
pub const SIM_V1_SERIAL: &str = "9900000037024e4500000007";

const FLASH_STEPS: u32 = 4;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Scripts ──────────────────────────────────────────────────────────

/// What the simulated USB device picker does on the next `connect()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimPick {
    /// Pick the first plugged-in device that is not excluded.
    First,
    /// Pick this serial, ignoring exclusions (the user found it anyway).
    Serial(String),
    /// The picker fails with a device error.
    Fail(DeviceErrorCode),
}

/// Outcome of the next Bluetooth / radio-bridge `connect()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimLink {
    Connect,
    /// Link attempt ends `DISCONNECTED`.
    Drop,
    /// User dismissed the picker: `NO_AUTHORIZED_DEVICE` again, with no
    /// `CONNECTING` in between.
    NoDevice,
    Error(DeviceErrorCode),
}

// ── USB ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct UsbState {
    plugged: Vec<String>,
    exclude: Vec<String>,
    selected: Option<String>,
    picks: VecDeque<SimPick>,
    flash_failures: VecDeque<Error>,
    flashed: Vec<String>,
    disconnects: u32,
}

/// Simulated WebUSB connection.
#[derive(Debug)]
pub struct SimUsb {
    status: StatusPublisher,
    state: Mutex<UsbState>,
    /// Handle that loses its device when this one selects the same board.
    claims_from: Option<Arc<SimUsb>>,
}

impl SimUsb {
    /// A USB transport with the given serial numbers plugged in.
    pub fn new<I, S>(plugged: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            status: StatusPublisher::new(TransportKind::Usb, DeviceConnectionStatus::NoAuthorizedDevice),
            state: Mutex::new(UsbState {
                plugged: plugged.into_iter().map(Into::into).collect(),
                ..UsbState::default()
            }),
            claims_from: None,
        }
    }

    fn with_exclusions(
        plugged: Vec<String>,
        options: UsbSelectionOptions,
        picks: VecDeque<SimPick>,
        claims_from: Option<Arc<SimUsb>>,
    ) -> Self {
        let usb = Self {
            claims_from,
            ..Self::new(plugged)
        };
        {
            let mut state = lock(&usb.state);
            state.exclude = options.exclude_serials;
            state.picks = picks;
        }
        usb
    }

    pub fn script_pick(&self, pick: SimPick) {
        lock(&self.state).picks.push_back(pick);
    }

    /// Make the next flash fail with `err`.
    pub fn fail_next_flash(&self, err: Error) {
        lock(&self.state).flash_failures.push_back(err);
    }

    /// Labels of every image successfully flashed, in order.
    pub fn flashed(&self) -> Vec<String> {
        lock(&self.state).flashed.clone()
    }

    /// Serial numbers hidden from this handle's picker.
    pub fn excluded(&self) -> Vec<String> {
        lock(&self.state).exclude.clone()
    }

    /// How many times `disconnect()` has been called on this handle.
    pub fn disconnect_count(&self) -> u32 {
        lock(&self.state).disconnects
    }

    /// Physically remove the selected device.
    pub fn unplug(&self) -> StatusChange {
        let mut state = lock(&self.state);
        if let Some(serial) = state.selected.clone() {
            state.plugged.retain(|s| *s != serial);
        }
        drop(state);
        self.status.set(DeviceConnectionStatus::Disconnected)
    }

    /// Force a status assignment.
    pub fn set_status(&self, status: DeviceConnectionStatus) -> StatusChange {
        self.status.set(status)
    }
}

#[async_trait]
impl DeviceTransport for SimUsb {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn status(&self) -> DeviceConnectionStatus {
        self.status.get()
    }

    fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.status.subscribe()
    }

    async fn connect(&self) -> Result<DeviceConnectionStatus, Error> {
        let pick = {
            let mut state = lock(&self.state);
            let pick = state.picks.pop_front().unwrap_or(SimPick::First);
            match pick {
                SimPick::First => state
                    .plugged
                    .iter()
                    .find(|s| !state.exclude.contains(*s))
                    .cloned()
                    .ok_or_else(|| Error::device(DeviceErrorCode::NoDeviceSelected, "no device chosen")),
                SimPick::Serial(serial) => Ok(serial),
                SimPick::Fail(code) => Err(Error::device(code, "picker failed")),
            }
        };

        match pick {
            Ok(serial) => {
                debug!(%serial, "sim usb: device selected");
                lock(&self.state).selected = Some(serial.clone());
                self.status.set(DeviceConnectionStatus::Connecting);
                tokio::task::yield_now().await;
                self.status.set(DeviceConnectionStatus::Connected);
                if let Some(owner) = &self.claims_from {
                    if owner.serial_number().as_deref() == Some(serial.as_str())
                        && owner.status() == DeviceConnectionStatus::Connected
                    {
                        debug!(%serial, "sim usb: device claimed from the session handle");
                        owner.status.set(DeviceConnectionStatus::Disconnected);
                    }
                }
                Ok(DeviceConnectionStatus::Connected)
            }
            Err(e) => {
                if lock(&self.state).selected.is_none() {
                    self.status.set(DeviceConnectionStatus::NoAuthorizedDevice);
                }
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), Error> {
        lock(&self.state).disconnects += 1;
        if self.status.get() != DeviceConnectionStatus::Disconnected {
            self.status.set(DeviceConnectionStatus::Disconnected);
        }
        Ok(())
    }
}

#[async_trait]
impl UsbTransport for SimUsb {
    fn device_id(&self) -> Option<u32> {
        lock(&self.state).selected.as_deref().and_then(device_id_from_serial)
    }

    fn serial_number(&self) -> Option<String> {
        lock(&self.state).selected.clone()
    }

    fn board_version(&self) -> Option<BoardVersion> {
        lock(&self.state)
            .selected
            .as_deref()
            .and_then(BoardVersion::from_serial_number)
    }

    async fn flash(&self, data: &dyn FlashDataSource, progress: ProgressFn<'_>) -> Result<(), Error> {
        if self.status.get() != DeviceConnectionStatus::Connected {
            return Err(Error::NotConnected { transport: "usb" });
        }
        let serial = self.serial_number().unwrap_or_default();
        let board = self
            .board_version()
            .ok_or_else(|| Error::UnknownBoard { serial: serial.clone() })?;

        let _image = data.hex_for(board).await?;
        let mut failure = lock(&self.state).flash_failures.pop_front();

        for step in 0..=FLASH_STEPS {
            progress(Some(f64::from(step) / f64::from(FLASH_STEPS)));
            tokio::task::yield_now().await;
            if step == FLASH_STEPS / 2 {
                if let Some(err) = failure.take() {
                    return Err(err);
                }
            }
        }
        progress(None);

        lock(&self.state).flashed.push(data.label());
        debug!(%serial, label = %data.label(), "sim usb: flashed");
        Ok(())
    }
}

/// Opens temporary [`SimUsb`] handles that share the plugged-in devices of
/// a main handle.
#[derive(Debug, Default)]
pub struct SimUsbFactory {
    plugged: Mutex<Vec<String>>,
    picks: Mutex<VecDeque<SimPick>>,
    opened: Mutex<Vec<Arc<SimUsb>>>,
    session: Option<Arc<SimUsb>>,
}

impl SimUsbFactory {
    pub fn new<I, S>(plugged: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            plugged: Mutex::new(plugged.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Handles opened from here take the device away from `session` when
    /// they select the board it holds, like a second WebUSB claim does.
    pub fn claiming_from(mut self, session: Arc<SimUsb>) -> Self {
        self.session = Some(session);
        self
    }

    /// Script the picker of the next handle this factory opens.
    pub fn script_pick(&self, pick: SimPick) {
        lock(&self.picks).push_back(pick);
    }

    /// Every handle opened so far.
    pub fn opened(&self) -> Vec<Arc<SimUsb>> {
        lock(&self.opened).clone()
    }
}

impl UsbTransportFactory for SimUsbFactory {
    fn open(&self, options: UsbSelectionOptions) -> Arc<dyn UsbTransport> {
        let picks: VecDeque<SimPick> = lock(&self.picks).pop_front().into_iter().collect();
        let usb = Arc::new(SimUsb::with_exclusions(
            lock(&self.plugged).clone(),
            options,
            picks,
            self.session.clone(),
        ));
        lock(&self.opened).push(Arc::clone(&usb));
        usb
    }
}

// ── Bluetooth ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LinkState {
    name_filter: Option<String>,
    remote: Option<(u32, Option<BoardVersion>)>,
    script: VecDeque<SimLink>,
    clear_count: u32,
    connect_count: u32,
}

/// Simulated Web Bluetooth connection.
#[derive(Debug)]
pub struct SimBluetooth {
    status: StatusPublisher,
    sensors: SensorHub,
    state: Mutex<LinkState>,
}

impl Default for SimBluetooth {
    fn default() -> Self {
        Self {
            status: StatusPublisher::new(
                TransportKind::Bluetooth,
                DeviceConnectionStatus::NoAuthorizedDevice,
            ),
            sensors: SensorHub::default(),
            state: Mutex::new(LinkState::default()),
        }
    }
}

impl SimBluetooth {
    pub fn script(&self, outcome: SimLink) {
        lock(&self.state).script.push_back(outcome);
    }

    pub fn name_filter(&self) -> Option<String> {
        lock(&self.state).name_filter.clone()
    }

    pub fn clear_count(&self) -> u32 {
        lock(&self.state).clear_count
    }

    pub fn connect_count(&self) -> u32 {
        lock(&self.state).connect_count
    }

    pub fn set_status(&self, status: DeviceConnectionStatus) -> StatusChange {
        self.status.set(status)
    }

    pub fn sensors(&self) -> &SensorHub {
        &self.sensors
    }
}

async fn run_link(status: &StatusPublisher, outcome: SimLink) -> Result<DeviceConnectionStatus, Error> {
    if outcome == SimLink::NoDevice {
        // The picker is dismissed before the link is attempted.
        return Ok(status.set(DeviceConnectionStatus::NoAuthorizedDevice).status);
    }
    status.set(DeviceConnectionStatus::Connecting);
    tokio::task::yield_now().await;
    let end = match outcome {
        SimLink::Connect => DeviceConnectionStatus::Connected,
        SimLink::Drop | SimLink::NoDevice => DeviceConnectionStatus::Disconnected,
        SimLink::Error(code) => {
            status.set(DeviceConnectionStatus::Disconnected);
            return Err(Error::device(code, "link failed"));
        }
    };
    status.set(end);
    Ok(end)
}

#[async_trait]
impl DeviceTransport for SimBluetooth {
    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }

    fn status(&self) -> DeviceConnectionStatus {
        self.status.get()
    }

    fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.status.subscribe()
    }

    async fn connect(&self) -> Result<DeviceConnectionStatus, Error> {
        let outcome = {
            let mut state = lock(&self.state);
            state.connect_count += 1;
            state.script.pop_front().unwrap_or(SimLink::Connect)
        };
        run_link(&self.status, outcome).await
    }

    async fn disconnect(&self) -> Result<(), Error> {
        self.status.set(DeviceConnectionStatus::Disconnected);
        Ok(())
    }
}

impl SensorSource for SimBluetooth {
    fn subscribe_accelerometer(&self) -> broadcast::Receiver<AccelerometerData> {
        self.sensors.subscribe_accelerometer()
    }

    fn subscribe_buttons(&self) -> broadcast::Receiver<ButtonEvent> {
        self.sensors.subscribe_buttons()
    }
}

#[async_trait]
impl BluetoothTransport for SimBluetooth {
    fn set_name_filter(&self, name: Option<String>) {
        lock(&self.state).name_filter = name;
    }

    async fn clear_device(&self) -> Result<(), Error> {
        lock(&self.state).clear_count += 1;
        self.status.set(DeviceConnectionStatus::Disconnected);
        self.status.set(DeviceConnectionStatus::NoAuthorizedDevice);
        Ok(())
    }
}

// ── Radio bridge ─────────────────────────────────────────────────────

/// Simulated radio bridge layered over a [`SimUsb`] handle.
#[derive(Debug)]
pub struct SimRadioBridge {
    usb: Arc<SimUsb>,
    status: StatusPublisher,
    sensors: SensorHub,
    state: Mutex<LinkState>,
}

impl SimRadioBridge {
    pub fn new(usb: Arc<SimUsb>) -> Self {
        Self {
            usb,
            status: StatusPublisher::new(
                TransportKind::RadioRemote,
                DeviceConnectionStatus::NoAuthorizedDevice,
            ),
            sensors: SensorHub::default(),
            state: Mutex::new(LinkState::default()),
        }
    }

    pub fn script(&self, outcome: SimLink) {
        lock(&self.state).script.push_back(outcome);
    }

    pub fn remote(&self) -> Option<(u32, Option<BoardVersion>)> {
        lock(&self.state).remote
    }

    pub fn set_status(&self, status: DeviceConnectionStatus) -> StatusChange {
        self.status.set(status)
    }

    pub fn sensors(&self) -> &SensorHub {
        &self.sensors
    }
}

#[async_trait]
impl DeviceTransport for SimRadioBridge {
    fn kind(&self) -> TransportKind {
        TransportKind::RadioRemote
    }

    fn status(&self) -> DeviceConnectionStatus {
        self.status.get()
    }

    fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.status.subscribe()
    }

    async fn connect(&self) -> Result<DeviceConnectionStatus, Error> {
        let outcome = {
            let mut state = lock(&self.state);
            if state.remote.is_none() {
                return Err(Error::NotConnected {
                    transport: "radio bridge (no remote device bound)",
                });
            }
            state.connect_count += 1;
            state.script.pop_front().unwrap_or(SimLink::Connect)
        };
        if self.usb.status() != DeviceConnectionStatus::Connected {
            self.status.set(DeviceConnectionStatus::NoAuthorizedDevice);
            return Ok(DeviceConnectionStatus::NoAuthorizedDevice);
        }
        run_link(&self.status, outcome).await
    }

    async fn disconnect(&self) -> Result<(), Error> {
        self.status.set(DeviceConnectionStatus::Disconnected);
        Ok(())
    }
}

impl SensorSource for SimRadioBridge {
    fn subscribe_accelerometer(&self) -> broadcast::Receiver<AccelerometerData> {
        self.sensors.subscribe_accelerometer()
    }

    fn subscribe_buttons(&self) -> broadcast::Receiver<ButtonEvent> {
        self.sensors.subscribe_buttons()
    }
}

impl RadioBridgeTransport for SimRadioBridge {
    fn set_remote_device(&self, device_id: u32, board_version: Option<BoardVersion>) {
        lock(&self.state).remote = Some((device_id, board_version));
    }
}

// ── Firmware ─────────────────────────────────────────────────────────

/// Resolves images exactly like the remote library but never touches the
/// network. The image text is a placeholder naming the resolved path.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimHexLibrary;

#[derive(Debug, Clone, Copy)]
struct SimHex {
    hex_type: HexType,
}

#[async_trait]
impl FlashDataSource for SimHex {
    async fn hex_for(&self, version: BoardVersion) -> Result<String, Error> {
        let version = version.into();
        resolve_hex_url(version, self.hex_type)
            .map(|path| format!(":sim {path}"))
            .ok_or(Error::UnsupportedFirmware {
                version,
                hex_type: self.hex_type,
            })
    }

    fn label(&self) -> String {
        self.hex_type.to_string()
    }
}

impl HexLibrary for SimHexLibrary {
    fn source(&self, hex_type: HexType) -> Box<dyn FlashDataSource> {
        Box::new(SimHex { hex_type })
    }
}
