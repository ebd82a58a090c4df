// ── Connection flow stage ──

use mblink_api::BoardVersion;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use tracing::warn;

use super::status::{ConnectionFlowType, ConnectionType};

/// UI steps a connection attempt passes through. `None` means no flow
/// dialog is active.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
pub enum ConnectionFlowStep {
    #[default]
    None,
    Start,
    ConnectCable,
    WebUsbFlashingTutorial,
    ManualFlashingTutorial,
    ConnectBattery,
    EnterBluetoothPattern,
    ConnectBluetoothTutorial,
    /// Transient: the USB device picker is open.
    WebUsbChooseMicrobit,
    FlashingInProgress,
    ConnectingBluetooth,
    ConnectingMicrobits,
    TryAgainReplugMicrobit,
    TryAgainCloseTabs,
    TryAgainSelectMicrobit,
    TryAgainBluetoothSelectMicrobit,
    BadFirmware,
    MicrobitUnsupported,
    ConnectFailed,
    ReconnectFailed,
    ReconnectFailedTwice,
    ConnectionLost,
}

impl ConnectionFlowStep {
    /// Steps that wait on an async operation rather than on the user.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::WebUsbChooseMicrobit
                | Self::FlashingInProgress
                | Self::ConnectingBluetooth
                | Self::ConnectingMicrobits
        )
    }
}

/// Which transports the host can use at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSupport {
    pub web_usb: bool,
    pub web_bluetooth: bool,
}

impl Default for TransportSupport {
    fn default() -> Self {
        Self {
            web_usb: true,
            web_bluetooth: true,
        }
    }
}

/// Mutable context of an in-progress connection flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStage {
    pub flow_type: ConnectionFlowType,
    pub flow_step: ConnectionFlowStep,
    pub is_web_bluetooth_supported: bool,
    pub is_web_usb_supported: bool,
    /// Name the Bluetooth picker is filtered on.
    pub bluetooth_microbit_name: Option<String>,
    /// Board flashed with the Bluetooth firmware in this flow. Unknown
    /// when the name was typed in.
    pub bluetooth_board_version: Option<BoardVersion>,
    /// The name was entered by hand, so any previously paired device has
    /// to be forgotten before connecting.
    pub clear_bluetooth_device: bool,
    /// The remote micro:bit flashed during a radio flow.
    pub radio_remote_device_id: Option<u32>,
    pub radio_remote_board_version: Option<BoardVersion>,
}

impl Default for ConnectionStage {
    fn default() -> Self {
        Self {
            flow_type: ConnectionFlowType::ConnectBluetooth,
            flow_step: ConnectionFlowStep::None,
            is_web_bluetooth_supported: true,
            is_web_usb_supported: true,
            bluetooth_microbit_name: None,
            bluetooth_board_version: None,
            clear_bluetooth_device: false,
            radio_remote_device_id: None,
            radio_remote_board_version: None,
        }
    }
}

impl ConnectionStage {
    /// A fresh stage at `Start`.
    ///
    /// The radio flow needs WebUSB and the Bluetooth flow needs Web
    /// Bluetooth; when the requested one is unavailable the other is used.
    pub fn new(flow_type: ConnectionFlowType, support: TransportSupport) -> Self {
        let wanted = flow_type.connection_type();
        let flow_type = match wanted {
            ConnectionType::Radio if !support.web_usb && support.web_bluetooth => {
                warn!("WebUSB unavailable, falling back to the Bluetooth flow");
                ConnectionFlowType::ConnectBluetooth
            }
            ConnectionType::Bluetooth if !support.web_bluetooth && support.web_usb => {
                warn!("Web Bluetooth unavailable, falling back to the radio flow");
                ConnectionFlowType::ConnectRadioRemote
            }
            ConnectionType::Radio => ConnectionFlowType::ConnectRadioRemote,
            ConnectionType::Bluetooth => ConnectionFlowType::ConnectBluetooth,
        };
        Self {
            flow_type,
            flow_step: ConnectionFlowStep::Start,
            is_web_bluetooth_supported: support.web_bluetooth,
            is_web_usb_supported: support.web_usb,
            ..Self::default()
        }
    }

    pub fn support(&self) -> TransportSupport {
        TransportSupport {
            web_usb: self.is_web_usb_supported,
            web_bluetooth: self.is_web_bluetooth_supported,
        }
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.flow_type.connection_type()
    }

    pub fn with_step(&self, flow_step: ConnectionFlowStep) -> Self {
        Self {
            flow_step,
            ..self.clone()
        }
    }

    /// Forget every device picked so far in this flow.
    pub fn clear_devices(&mut self) {
        self.bluetooth_microbit_name = None;
        self.bluetooth_board_version = None;
        self.clear_bluetooth_device = false;
        self.radio_remote_device_id = None;
        self.radio_remote_board_version = None;
    }
}
