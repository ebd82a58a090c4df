// ── Connection state reducer ──
//
// Maps one transport status change onto the session's high-level
// `ConnectionStatus`. Pure apart from the `SessionFlags` it is handed.
// Rule order is significant: the first matching rule wins.

use mblink_api::{DeviceConnectionStatus, TransportKind};

use crate::model::{ConnectionFlowType, ConnectionStatus, ConnectionType, SessionFlags};

/// Everything the reducer looks at besides the session flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInput {
    pub connection_type: ConnectionType,
    pub current: ConnectionStatus,
    /// The transport status just observed.
    pub device_status: DeviceConnectionStatus,
    /// The same transport's status before this change.
    pub prev_device_status: DeviceConnectionStatus,
    pub source: TransportKind,
    pub is_tab_visible: bool,
}

/// A status change produced by the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: ConnectionStatus,
    pub flow_type: ConnectionFlowType,
}

/// Compute the next connection status, or `None` for no change.
pub fn next_status(input: &StatusInput, flags: &mut SessionFlags) -> Option<StatusUpdate> {
    use crate::model::ConnectionStatus as S;
    use mblink_api::DeviceConnectionStatus as D;

    // The user disconnected: nothing changes until they reconnect.
    if input.current == S::Disconnected {
        return None;
    }
    // Don't replace a failure the user has not seen yet.
    if !input.is_tab_visible && input.current.is_failure() {
        return None;
    }

    let has_started_over = input.current.has_started_over();
    if has_started_over {
        flags.reset();
    }

    let default_flow = input.connection_type.default_flow_type();
    let update = |status| {
        Some(StatusUpdate {
            status,
            flow_type: default_flow,
        })
    };

    if input.source == TransportKind::Usb {
        return usb_status(input, flags);
    }

    let raw = input.device_status;
    let prev = input.prev_device_status;

    if raw == D::Connected {
        flags.on_first_connect_attempt = false;
        flags.has_attempted_reconnect = false;
        return update(S::Connected);
    }
    // Expected while a previous device is cleared before a fresh flow.
    if raw == D::Disconnected && input.current == S::NotConnected {
        return update(S::NotConnected);
    }
    if flags.on_first_connect_attempt && input.current == S::Connecting && raw == D::Disconnected {
        flags.on_first_connect_attempt = false;
        flags.has_attempted_reconnect = true;
        return update(S::FailedToConnect);
    }
    if input.source == TransportKind::Bluetooth
        && prev == D::NoAuthorizedDevice
        && raw == D::NoAuthorizedDevice
    {
        return update(S::FailedToSelectBluetoothDevice);
    }
    if !flags.on_first_connect_attempt && flags.has_attempted_reconnect && raw == D::Disconnected {
        flags.reset();
        return update(S::FailedToReconnectTwice);
    }
    if raw == D::Disconnected && matches!(prev, D::Connecting | D::NoAuthorizedDevice) {
        flags.has_attempted_reconnect = true;
        return update(S::FailedToReconnect);
    }
    if raw == D::Disconnected && input.current == S::ReconnectingAutomatically {
        flags.has_attempted_reconnect = true;
        return update(S::ConnectionLost);
    }
    if raw == D::Connecting && has_started_over {
        return update(S::Connecting);
    }
    if raw == D::Reconnecting && !flags.on_first_connect_attempt {
        return update(S::ReconnectingAutomatically);
    }
    // The link device fell back to unauthorised: the bridge, not the
    // remote, was unplugged.
    if input.connection_type == ConnectionType::Radio
        && raw == D::NoAuthorizedDevice
        && input.current == S::ReconnectingAutomatically
    {
        return Some(StatusUpdate {
            status: S::ConnectionLost,
            flow_type: ConnectionFlowType::ConnectRadioBridge,
        });
    }
    None
}

/// USB events only tell us about the radio bridge's health.
fn usb_status(input: &StatusInput, flags: &mut SessionFlags) -> Option<StatusUpdate> {
    use crate::model::ConnectionStatus as S;

    if input.connection_type != ConnectionType::Radio
        || flags.on_first_connect_attempt
        || input.device_status != DeviceConnectionStatus::Disconnected
        || input.current == S::NotConnected
        || input.current.is_reconnecting()
    {
        return None;
    }

    let flow_type = ConnectionFlowType::ConnectRadioRemote;
    if !input.is_tab_visible {
        return Some(StatusUpdate {
            status: S::ReconnectingAutomatically,
            flow_type,
        });
    }
    if flags.has_attempted_reconnect {
        flags.reset();
        return Some(StatusUpdate {
            status: S::FailedToReconnectTwice,
            flow_type,
        });
    }
    flags.has_attempted_reconnect = true;
    let status = if input.current == S::Connected {
        S::ConnectionLost
    } else {
        S::FailedToReconnect
    };
    Some(StatusUpdate { status, flow_type })
}
