// ── Connection status and results ──

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// High-level connection status. Exactly one value is current per session.
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
pub enum ConnectionStatus {
    /// No connection has been made yet, or the flow was abandoned.
    #[default]
    NotConnected,
    Connecting,
    Connected,
    /// The user disconnected explicitly.
    Disconnected,
    ConnectionLost,
    ReconnectingAutomatically,
    ReconnectingExplicitly,
    FailedToConnect,
    FailedToReconnect,
    FailedToReconnectTwice,
    FailedToSelectBluetoothDevice,
}

impl ConnectionStatus {
    /// Statuses from which the next attempt counts as a fresh start.
    pub fn has_started_over(self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::FailedToConnect | Self::FailedToReconnectTwice
        )
    }

    /// Failure and loss statuses the user has to acknowledge.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::FailedToConnect
                | Self::FailedToReconnect
                | Self::FailedToReconnectTwice
                | Self::ConnectionLost
        )
    }

    pub fn is_reconnecting(self) -> bool {
        matches!(
            self,
            Self::ReconnectingAutomatically | Self::ReconnectingExplicitly
        )
    }
}

/// Transport family chosen for the session.
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
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Bluetooth,
    Radio,
}

impl ConnectionType {
    /// Flow type reported when an event does not pin a specific device.
    pub fn default_flow_type(self) -> ConnectionFlowType {
        match self {
            Self::Bluetooth => ConnectionFlowType::ConnectBluetooth,
            Self::Radio => ConnectionFlowType::ConnectRadioRemote,
        }
    }
}

/// Which transport combination a flow or status pertains to.
///
/// `ConnectRadioRemote` and `ConnectRadioBridge` are the two micro:bits of
/// one bridged radio link.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
pub enum ConnectionFlowType {
    ConnectBluetooth,
    ConnectRadioRemote,
    ConnectRadioBridge,
}

impl ConnectionFlowType {
    pub fn connection_type(self) -> ConnectionType {
        match self {
            Self::ConnectBluetooth => ConnectionType::Bluetooth,
            Self::ConnectRadioRemote | Self::ConnectRadioBridge => ConnectionType::Radio,
        }
    }
}

/// Session-scoped reducer flags, owned by the session and mutated only by
/// the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFlags {
    pub has_attempted_reconnect: bool,
    pub on_first_connect_attempt: bool,
}

impl Default for SessionFlags {
    fn default() -> Self {
        Self {
            has_attempted_reconnect: false,
            on_first_connect_attempt: true,
        }
    }
}

impl SessionFlags {
    /// Back to a fresh-start state. Both flags always move together.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Outcome of a flash or connect operation. Closed: nothing else escapes
/// the façade.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
pub enum ConnectResult {
    Success,
    Failed,
    ErrorMicrobitUnsupported,
    ErrorBadFirmware,
    ErrorNoDeviceSelected,
    ErrorUnableToClaimInterface,
}

impl ConnectResult {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Failures the user can fix by trying again in place.
    pub fn is_user_recoverable(self) -> bool {
        matches!(
            self,
            Self::ErrorNoDeviceSelected | Self::ErrorUnableToClaimInterface
        )
    }
}
