// ── Download flow state ──

use mblink_api::HexData;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Steps of the program download flow. `None` means no download dialog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum DownloadStep {
    #[default]
    None,
    Help,
    ChooseSameOrDifferentMicrobit,
    ConnectCable,
    ConnectRadioRemoteMicrobit,
    UnplugRadioBridgeMicrobit,
    WebUsbFlashingTutorial,
    /// Transient: the USB device picker is open.
    WebUsbChooseMicrobit,
    FlashingInProgress,
    ManualFlashingTutorial,
    IncompatibleDevice,
}

/// Which micro:bit the user wants the program on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum MicrobitToFlash {
    /// No choice offered: nothing is connected.
    #[default]
    Default,
    /// The micro:bit the session is connected to.
    Same,
    /// Another micro:bit, selected through a temporary USB connection.
    Different,
}

/// Lifecycle of one download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadState {
    pub step: DownloadStep,
    pub microbit_to_flash: MicrobitToFlash,
    pub hex: Option<HexData>,
    /// Device id of the micro:bit being flashed, once selected.
    pub usb_device_id: Option<u32>,
    /// Flash progress, 0-100.
    pub flash_progress: u8,
    pub show_help: bool,
}

impl Default for DownloadState {
    fn default() -> Self {
        Self {
            step: DownloadStep::None,
            microbit_to_flash: MicrobitToFlash::Default,
            hex: None,
            usb_device_id: None,
            flash_progress: 0,
            show_help: true,
        }
    }
}
