//! Transport traits.
//!
//! One object per transport (USB, Bluetooth, radio bridge). Every transport
//! owns its status and exposes connect/disconnect plus a status
//! subscription; the transport-specific operations live on the sub-traits.
//! Wire framing is entirely the implementor's business.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::board::BoardVersion;
use crate::error::Error;
use crate::hex::FlashDataSource;
use crate::sensor::{AccelerometerData, ButtonEvent};
use crate::status::{DeviceConnectionStatus, StatusChange, TransportKind};

/// Flash progress callback. `Some(fraction)` in `0.0..=1.0`, `None` once
/// the transfer is done.
pub type ProgressFn<'a> = &'a (dyn Fn(Option<f64>) + Send + Sync);

/// Operations shared by every transport.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn status(&self) -> DeviceConnectionStatus;

    /// Subscribe to every status assignment on this transport.
    fn subscribe_status(&self) -> broadcast::Receiver<StatusChange>;

    /// Connect, prompting for a device if none is authorised yet.
    ///
    /// Callers must not issue a second `connect()` while one is in flight.
    async fn connect(&self) -> Result<DeviceConnectionStatus, Error>;

    async fn disconnect(&self) -> Result<(), Error>;
}

/// Accelerometer and button streams.
pub trait SensorSource: Send + Sync {
    fn subscribe_accelerometer(&self) -> broadcast::Receiver<AccelerometerData>;

    fn subscribe_buttons(&self) -> broadcast::Receiver<ButtonEvent>;
}

/// A micro:bit attached over USB (WebUSB / CMSIS-DAP).
#[async_trait]
pub trait UsbTransport: DeviceTransport {
    /// Device id derived from the serial number, once a device is selected.
    fn device_id(&self) -> Option<u32>;

    fn serial_number(&self) -> Option<String>;

    fn board_version(&self) -> Option<BoardVersion>;

    /// Transfer firmware onto the device.
    ///
    /// The transport asks `data` for the image matching the detected board.
    async fn flash(&self, data: &dyn FlashDataSource, progress: ProgressFn<'_>) -> Result<(), Error>;
}

/// A micro:bit streaming sensor data over Bluetooth Low Energy.
#[async_trait]
pub trait BluetoothTransport: DeviceTransport + SensorSource {
    /// Restrict the device picker to an advertised name.
    fn set_name_filter(&self, name: Option<String>);

    /// Forget the previously paired device.
    async fn clear_device(&self) -> Result<(), Error>;
}

/// A USB-attached bridge relaying radio packets from a remote micro:bit.
pub trait RadioBridgeTransport: DeviceTransport + SensorSource {
    /// Bind the remote device the bridge should listen for.
    fn set_remote_device(&self, device_id: u32, board_version: Option<BoardVersion>);
}

/// Device picker restrictions for a freshly opened USB handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbSelectionOptions {
    /// Serial numbers hidden from the picker.
    pub exclude_serials: Vec<String>,
}

/// Opens additional, short-lived USB handles alongside the main one.
pub trait UsbTransportFactory: Send + Sync {
    fn open(&self, options: UsbSelectionOptions) -> Arc<dyn UsbTransport>;
}
