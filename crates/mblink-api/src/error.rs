use strum::{Display, EnumString};
use thiserror::Error;

use crate::hex::{HexType, HexVersion};

/// Closed set of failure codes a device transport can report.
///
/// The string forms match the codes emitted by the underlying device
/// library, so they can be parsed straight out of its error payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum DeviceErrorCode {
    /// Device firmware (DAPLink / interface chip) is too old.
    #[strum(serialize = "update-req")]
    UpdateRequired,
    ClearConnect,
    NoDeviceSelected,
    ReconnectMicrobit,
    UnableToClaimInterface,
    TimeoutError,
    BackgroundCommsError,
    /// Anything the transport reports that is not in this table.
    #[strum(default)]
    Unknown(String),
}

/// Top-level error type for the `mblink-api` crate.
///
/// Covers every failure mode at the transport boundary: device-side
/// errors, firmware resolution and fetching, and HTTP plumbing.
/// `mblink-core` maps these into `ConnectResult` values.
#[derive(Debug, Error)]
pub enum Error {
    // ── Device ──────────────────────────────────────────────────────
    /// The transport reported a coded device error.
    #[error("Device error ({code}): {message}")]
    Device {
        code: DeviceErrorCode,
        message: String,
    },

    /// An operation required a connected device and there is none.
    #[error("No device connected on {transport}")]
    NotConnected { transport: &'static str },

    // ── Firmware ────────────────────────────────────────────────────
    /// No firmware image exists for this board version / hex type pair.
    #[error("No {hex_type} firmware available for board {version}")]
    UnsupportedFirmware { version: HexVersion, hex_type: HexType },

    /// The board version could not be determined before flashing.
    #[error("Unknown board version for device {serial}")]
    UnknownBoard { serial: String },

    /// Fetching flash data failed (non-OK HTTP status or network failure).
    ///
    /// Kept separate from [`Error::Device`] so callers can tell a missing
    /// image apart from a failed transfer.
    #[error("Failed to fetch flash data from {url}: {reason}")]
    FlashData { url: String, reason: String },

    /// The flash-data request exceeded the configured timeout.
    #[error("Timed out fetching flash data from {url}")]
    FlashDataTimeout { url: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP client construction error.
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl Error {
    /// Build a device error from a code.
    pub fn device(code: DeviceErrorCode, message: impl Into<String>) -> Self {
        Self::Device {
            code,
            message: message.into(),
        }
    }

    /// The device error code, if this is a device-side failure.
    pub fn device_code(&self) -> Option<&DeviceErrorCode> {
        match self {
            Self::Device { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Returns `true` if the error came from fetching flash data rather
    /// than from the device itself.
    pub fn is_flash_data(&self) -> bool {
        matches!(self, Self::FlashData { .. } | Self::FlashDataTimeout { .. })
    }

    /// Returns `true` if the user can fix this by retrying in place
    /// (re-selecting a device, closing other tabs).
    pub fn is_user_recoverable(&self) -> bool {
        matches!(
            self.device_code(),
            Some(DeviceErrorCode::NoDeviceSelected | DeviceErrorCode::UnableToClaimInterface)
        )
    }
}
