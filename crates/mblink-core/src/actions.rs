// ── Connect actions ──
//
// One interface over the USB, Bluetooth and radio-bridge transports.
// Transport errors stop here: every flash or connect operation resolves
// to a `ConnectResult`, never to an `Err`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use futures_util::stream::select_all;
use mblink_api::{
    BluetoothTransport, BoardVersion, DeviceConnectionStatus, DeviceErrorCode, Error,
    FetchConfig, FlashDataSource, HexData, HexFetcher, HexLibrary, HexType, RadioBridgeTransport,
    RemoteHexLibrary, StatusChange, UsbSelectionOptions, UsbTransport, UsbTransportFactory,
};
use mblink_api::{AccelerometerData, ButtonEvent};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::CoreError;
use crate::model::{ConnectResult, ConnectionType};

/// Called when the user picks the micro:bit the session already uses.
pub type SameDeviceFn = Arc<dyn Fn() + Send + Sync>;

/// Flash progress sink, 0-100.
pub type PercentFn<'a> = &'a (dyn Fn(u8) + Send + Sync);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Error table ──────────────────────────────────────────────────────

/// Translate a transport error into its `ConnectResult`.
///
/// Exhaustive on purpose: a new device code does not compile until it is
/// given a result.
pub fn connect_result_for(err: &Error) -> ConnectResult {
    match err {
        Error::Device { code, .. } => match code {
            DeviceErrorCode::UpdateRequired => ConnectResult::ErrorBadFirmware,
            DeviceErrorCode::NoDeviceSelected => ConnectResult::ErrorNoDeviceSelected,
            DeviceErrorCode::UnableToClaimInterface => ConnectResult::ErrorUnableToClaimInterface,
            DeviceErrorCode::ClearConnect
            | DeviceErrorCode::ReconnectMicrobit
            | DeviceErrorCode::TimeoutError
            | DeviceErrorCode::BackgroundCommsError
            | DeviceErrorCode::Unknown(_) => ConnectResult::Failed,
        },
        Error::UnsupportedFirmware { .. } => ConnectResult::ErrorMicrobitUnsupported,
        Error::NotConnected { .. }
        | Error::UnknownBoard { .. }
        | Error::FlashData { .. }
        | Error::FlashDataTimeout { .. }
        | Error::Http(_)
        | Error::InvalidUrl(_) => ConnectResult::Failed,
    }
}

fn link_result(outcome: Result<DeviceConnectionStatus, Error>, transport: &'static str) -> ConnectResult {
    match outcome {
        Ok(DeviceConnectionStatus::Connected) => ConnectResult::Success,
        Ok(DeviceConnectionStatus::NoAuthorizedDevice) => ConnectResult::ErrorNoDeviceSelected,
        Ok(status) => {
            debug!(transport, %status, "link did not come up");
            ConnectResult::Failed
        }
        Err(e) => {
            let result = connect_result_for(&e);
            warn!(transport, error = %e, %result, "connect failed");
            result
        }
    }
}

// ── Progress ─────────────────────────────────────────────────────────

/// Whole percent for a transport's 0.0-1.0 fraction.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::as_conversions)]
fn percent(fraction: f64) -> u8 {
    if fraction.is_nan() {
        return 0;
    }
    // Clamped to 0..=100, so the cast is exact.
    (fraction.clamp(0.0, 1.0) * 100.0).round() as u8
}

/// Forwards only increasing percentages; "done" becomes 100 once.
struct ProgressTracker<'a> {
    sink: PercentFn<'a>,
    last: Mutex<Option<u8>>,
}

impl<'a> ProgressTracker<'a> {
    fn new(sink: PercentFn<'a>) -> Self {
        Self {
            sink,
            last: Mutex::new(None),
        }
    }

    fn report(&self, fraction: Option<f64>) {
        self.emit(fraction.map_or(100, percent));
    }

    fn finish(&self) {
        self.emit(100);
    }

    fn emit(&self, value: u8) {
        {
            let mut last = lock(&self.last);
            if last.is_some_and(|prev| value <= prev) {
                return;
            }
            *last = Some(value);
        }
        (self.sink)(value);
    }
}

// ── Façade ───────────────────────────────────────────────────────────

/// The transports a session drives.
#[derive(Clone)]
pub struct Transports {
    pub usb: Arc<dyn UsbTransport>,
    pub bluetooth: Arc<dyn BluetoothTransport>,
    pub radio_bridge: Arc<dyn RadioBridgeTransport>,
    /// Opens the short-lived USB handles used to flash another micro:bit.
    pub usb_factory: Arc<dyn UsbTransportFactory>,
}

/// What to flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HexSource {
    /// A precompiled image, resolved for the detected board.
    Firmware(HexType),
    /// A user program.
    Program(HexData),
}

/// Outcome of a USB device selection.
pub struct UsbConnection {
    pub result: ConnectResult,
    pub device_id: Option<u32>,
    /// The connected handle, on success.
    pub usb: Option<Arc<dyn UsbTransport>>,
}

/// Identifies a sensor listener for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    sensors: HashMap<ListenerId, CancellationToken>,
    status: HashMap<ConnectionType, CancellationToken>,
}

/// Transport-agnostic connection operations.
pub struct ConnectActions {
    transports: Transports,
    hexes: Arc<dyn HexLibrary>,
    listeners: Mutex<Listeners>,
}

impl ConnectActions {
    pub fn new(transports: Transports, hexes: Arc<dyn HexLibrary>) -> Self {
        Self {
            transports,
            hexes,
            listeners: Mutex::new(Listeners::default()),
        }
    }

    /// Fetch precompiled firmware over HTTP as configured.
    pub fn with_remote_firmware(transports: Transports, config: &SessionConfig) -> Result<Self, CoreError> {
        let fetcher = HexFetcher::new(&FetchConfig {
            timeout: config.fetch_timeout,
            ..FetchConfig::default()
        })?;
        let hexes = RemoteHexLibrary::new(fetcher, config.firmware_base_url.clone());
        Ok(Self::new(transports, Arc::new(hexes)))
    }

    pub fn usb(&self) -> &Arc<dyn UsbTransport> {
        &self.transports.usb
    }

    pub fn bluetooth(&self) -> &Arc<dyn BluetoothTransport> {
        &self.transports.bluetooth
    }

    pub fn radio_bridge(&self) -> &Arc<dyn RadioBridgeTransport> {
        &self.transports.radio_bridge
    }

    // ── USB ──────────────────────────────────────────────────────────

    /// Open a temporary USB handle whose picker hides the session's own
    /// micro:bit.
    pub fn open_temporary_usb(&self) -> Arc<dyn UsbTransport> {
        let exclude_serials = self.transports.usb.serial_number().into_iter().collect();
        self.transports
            .usb_factory
            .open(UsbSelectionOptions { exclude_serials })
    }

    /// Ask the user to select a micro:bit over USB.
    ///
    /// Uses `usb` when given (a temporary handle), the session's handle
    /// otherwise. If a temporary handle ends up on the session's own
    /// micro:bit, `on_same_device` is called before returning.
    pub async fn request_usb_connection(
        &self,
        usb: Option<&Arc<dyn UsbTransport>>,
        on_same_device: Option<&SameDeviceFn>,
    ) -> UsbConnection {
        let usb = usb.map_or_else(|| Arc::clone(&self.transports.usb), Arc::clone);
        if let Err(e) = usb.connect().await {
            let result = connect_result_for(&e);
            debug!(error = %e, %result, "USB device selection failed");
            return UsbConnection {
                result,
                device_id: None,
                usb: None,
            };
        }

        let device_id = usb.device_id();
        let is_session_handle = Arc::ptr_eq(&usb, &self.transports.usb);
        if !is_session_handle && device_id.is_some() && device_id == self.transports.usb.device_id() {
            info!(?device_id, "selected the micro:bit the session already uses");
            if let Some(callback) = on_same_device {
                callback();
            }
        }
        debug!(?device_id, "USB device selected");
        UsbConnection {
            result: ConnectResult::Success,
            device_id,
            usb: Some(usb),
        }
    }

    /// Flash a connected micro:bit.
    ///
    /// Progress goes to `on_progress` as non-decreasing whole percentages,
    /// ending with 100 on success.
    pub async fn flash_microbit(
        &self,
        source: &HexSource,
        on_progress: PercentFn<'_>,
        usb: Option<&Arc<dyn UsbTransport>>,
    ) -> ConnectResult {
        let usb = usb.unwrap_or(&self.transports.usb);
        let firmware;
        let data: &dyn FlashDataSource = match source {
            HexSource::Firmware(hex_type) => {
                firmware = self.hexes.source(*hex_type);
                firmware.as_ref()
            }
            HexSource::Program(program) => program,
        };

        let tracker = ProgressTracker::new(on_progress);
        match usb.flash(data, &|p: Option<f64>| tracker.report(p)).await {
            Ok(()) => {
                tracker.finish();
                info!(image = %data.label(), "flashed micro:bit");
                ConnectResult::Success
            }
            Err(e) => {
                let result = connect_result_for(&e);
                warn!(image = %data.label(), error = %e, %result, "flashing failed");
                result
            }
        }
    }

    /// Select a micro:bit and flash it. Selection failures short-circuit.
    pub async fn request_usb_connection_and_flash(
        &self,
        source: &HexSource,
        on_progress: PercentFn<'_>,
        usb: Option<&Arc<dyn UsbTransport>>,
        on_same_device: Option<&SameDeviceFn>,
    ) -> UsbConnection {
        let connection = self.request_usb_connection(usb, on_same_device).await;
        let Some(handle) = connection.usb.as_ref() else {
            return connection;
        };
        let result = self.flash_microbit(source, on_progress, Some(handle)).await;
        UsbConnection { result, ..connection }
    }

    // ── Links ────────────────────────────────────────────────────────

    /// Connect over Bluetooth.
    ///
    /// `clear_device` forgets the previously paired micro:bit first; `name`
    /// restricts the picker so a micro:bit already known from USB is not
    /// asked for again.
    pub async fn connect_bluetooth(&self, name: Option<String>, clear_device: bool) -> ConnectResult {
        let bluetooth = &self.transports.bluetooth;
        if clear_device {
            if let Err(e) = bluetooth.clear_device().await {
                let result = connect_result_for(&e);
                warn!(error = %e, %result, "clearing the paired micro:bit failed");
                return result;
            }
        }
        debug!(name = ?name, clear_device, "connecting over Bluetooth");
        bluetooth.set_name_filter(name);
        link_result(bluetooth.connect().await, "bluetooth")
    }

    /// Bind the remote micro:bit to the bridge and connect the bridge.
    pub async fn connect_microbits_serial(
        &self,
        device_id: u32,
        board_version: Option<BoardVersion>,
    ) -> ConnectResult {
        let bridge = &self.transports.radio_bridge;
        debug!(device_id, ?board_version, "connecting radio bridge");
        bridge.set_remote_device(device_id, board_version);
        link_result(bridge.connect().await, "radio bridge")
    }

    /// Disconnect every transport the connection type uses.
    pub async fn disconnect(&self, connection_type: ConnectionType) {
        let results = match connection_type {
            ConnectionType::Bluetooth => vec![("bluetooth", self.transports.bluetooth.disconnect().await)],
            ConnectionType::Radio => vec![
                ("radio bridge", self.transports.radio_bridge.disconnect().await),
                ("usb", self.transports.usb.disconnect().await),
            ],
        };
        for (transport, result) in results {
            if let Err(e) = result {
                warn!(transport, error = %e, "disconnect failed (non-fatal)");
            }
        }
    }

    // ── Listeners ────────────────────────────────────────────────────

    /// Forward accelerometer samples from whichever link is active.
    pub fn add_accelerometer_listener(&self, tx: mpsc::UnboundedSender<AccelerometerData>) -> ListenerId {
        let receivers = vec![
            self.transports.bluetooth.subscribe_accelerometer(),
            self.transports.radio_bridge.subscribe_accelerometer(),
        ];
        self.add_sensor_listener(receivers, tx, "accelerometer")
    }

    /// Forward button events from whichever link is active.
    pub fn add_button_listener(&self, tx: mpsc::UnboundedSender<ButtonEvent>) -> ListenerId {
        let receivers = vec![
            self.transports.bluetooth.subscribe_buttons(),
            self.transports.radio_bridge.subscribe_buttons(),
        ];
        self.add_sensor_listener(receivers, tx, "buttons")
    }

    fn add_sensor_listener<T>(
        &self,
        receivers: Vec<broadcast::Receiver<T>>,
        tx: mpsc::UnboundedSender<T>,
        kind: &'static str,
    ) -> ListenerId
    where
        T: Clone + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let id = {
            let mut listeners = lock(&self.listeners);
            let id = ListenerId(listeners.next_id);
            listeners.next_id += 1;
            listeners.sensors.insert(id, cancel.clone());
            id
        };
        spawn_forwarder(receivers, tx, cancel, kind);
        id
    }

    /// Stop a sensor listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let removed = lock(&self.listeners).sensors.remove(&id);
        removed.map(|cancel| cancel.cancel()).is_some()
    }

    /// Forward status changes for a connection type.
    ///
    /// Bluetooth sessions listen to the Bluetooth transport; radio sessions
    /// listen to the bridge and to the USB transport underneath it, whose
    /// status reveals the bridge being unplugged. A second registration for
    /// the same type replaces the first.
    pub fn add_status_listener(&self, connection_type: ConnectionType, tx: mpsc::UnboundedSender<StatusChange>) {
        let receivers = match connection_type {
            ConnectionType::Bluetooth => vec![self.transports.bluetooth.subscribe_status()],
            ConnectionType::Radio => vec![
                self.transports.radio_bridge.subscribe_status(),
                self.transports.usb.subscribe_status(),
            ],
        };
        let cancel = CancellationToken::new();
        let previous = lock(&self.listeners)
            .status
            .insert(connection_type, cancel.clone());
        if let Some(previous) = previous {
            debug!(%connection_type, "replacing status listener");
            previous.cancel();
        }
        spawn_forwarder(receivers, tx, cancel, "status");
    }

    pub fn remove_status_listener(&self, connection_type: ConnectionType) -> bool {
        let removed = lock(&self.listeners).status.remove(&connection_type);
        removed.map(|cancel| cancel.cancel()).is_some()
    }

    /// Stop every listener.
    pub fn remove_all_listeners(&self) {
        let mut listeners = lock(&self.listeners);
        let sensors = listeners.sensors.drain().map(|(_, cancel)| cancel).collect::<Vec<_>>();
        let status = listeners.status.drain().map(|(_, cancel)| cancel);
        for cancel in sensors.into_iter().chain(status) {
            cancel.cancel();
        }
    }
}

/// Merge broadcast receivers into an mpsc sender until cancelled or the
/// receiving side goes away.
fn spawn_forwarder<T>(
    receivers: Vec<broadcast::Receiver<T>>,
    tx: mpsc::UnboundedSender<T>,
    cancel: CancellationToken,
    kind: &'static str,
) where
    T: Clone + Send + 'static,
{
    let mut stream = select_all(receivers.into_iter().map(BroadcastStream::new));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                item = stream.next() => match item {
                    Some(Ok(value)) => {
                        if tx.send(value).is_err() {
                            break;
                        }
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!(listener = kind, skipped, "listener fell behind");
                    }
                    None => break,
                },
            }
        }
        debug!(listener = kind, "listener stopped");
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[test]
    fn device_codes_map_to_results() {
        let cases = [
            (DeviceErrorCode::UpdateRequired, ConnectResult::ErrorBadFirmware),
            (DeviceErrorCode::NoDeviceSelected, ConnectResult::ErrorNoDeviceSelected),
            (
                DeviceErrorCode::UnableToClaimInterface,
                ConnectResult::ErrorUnableToClaimInterface,
            ),
            (DeviceErrorCode::ClearConnect, ConnectResult::Failed),
            (DeviceErrorCode::ReconnectMicrobit, ConnectResult::Failed),
            (DeviceErrorCode::TimeoutError, ConnectResult::Failed),
            (DeviceErrorCode::BackgroundCommsError, ConnectResult::Failed),
            (DeviceErrorCode::Unknown("bluetooth-missing-services".into()), ConnectResult::Failed),
        ];
        for (code, expected) in cases {
            let err = Error::device(code.clone(), "boom");
            assert_eq!(connect_result_for(&err), expected, "{code}");
        }
    }

    #[test]
    fn missing_firmware_means_unsupported_microbit() {
        let err = Error::UnsupportedFirmware {
            version: mblink_api::HexVersion::V1,
            hex_type: HexType::RadioBridge,
        };
        assert_eq!(connect_result_for(&err), ConnectResult::ErrorMicrobitUnsupported);

        let fetch = Error::FlashData {
            url: "https://example.test/x.hex".into(),
            reason: "HTTP 500".into(),
        };
        assert_eq!(connect_result_for(&fetch), ConnectResult::Failed);
    }

    #[test]
    fn percent_clamps_and_rounds() {
        assert_eq!(percent(0.0), 0);
        assert_eq!(percent(0.254), 25);
        assert_eq!(percent(1.7), 100);
        assert_eq!(percent(-0.5), 0);
        assert_eq!(percent(f64::NAN), 0);
    }

    #[test]
    fn tracker_never_goes_backwards_and_ends_at_100() {
        let seen = StdMutex::new(Vec::new());
        let sink = |p: u8| seen.lock().unwrap().push(p);
        let tracker = ProgressTracker::new(&sink);

        for fraction in [Some(0.0), Some(0.5), Some(0.4), Some(0.5), Some(0.9), None, None] {
            tracker.report(fraction);
        }
        tracker.finish();

        assert_eq!(seen.into_inner().unwrap(), vec![0, 50, 90, 100]);
    }

    #[test]
    fn tracker_finish_emits_100_when_transport_never_signals_done() {
        let seen = StdMutex::new(Vec::new());
        let sink = |p: u8| seen.lock().unwrap().push(p);
        let tracker = ProgressTracker::new(&sink);

        tracker.report(Some(0.75));
        tracker.finish();

        assert_eq!(seen.into_inner().unwrap(), vec![75, 100]);
    }
}
