// mblink-api: Transport boundary for micro:bit USB, Bluetooth and radio-bridge links

pub mod board;
pub mod error;
pub mod fetch;
pub mod hex;
pub mod sensor;
pub mod sim;
pub mod status;
pub mod transport;

pub use board::{BoardVersion, device_id_from_serial, device_id_to_microbit_name};
pub use error::{DeviceErrorCode, Error};
pub use fetch::{FetchConfig, HexFetcher};
pub use hex::{
    FlashDataSource, HexData, HexLibrary, HexType, HexVersion, RemoteHex, RemoteHexLibrary,
    resolve_hex_url,
};
pub use sensor::{AccelerometerData, Button, ButtonEvent, SensorHub};
pub use status::{DeviceConnectionStatus, StatusChange, StatusPublisher, TransportKind};
pub use transport::{
    BluetoothTransport, DeviceTransport, ProgressFn, RadioBridgeTransport, SensorSource,
    UsbSelectionOptions, UsbTransport, UsbTransportFactory,
};
