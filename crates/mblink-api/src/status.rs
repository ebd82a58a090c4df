// ── Transport status ──
//
// Each transport owns one `DeviceConnectionStatus` value and publishes an
// immutable `StatusChange` message every time it is assigned. Consumers
// never share or mutate a transport's status.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use tokio::sync::{broadcast, watch};
use tracing::trace;

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Transport-level connection status, one instance per transport.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceConnectionStatus {
    Connected,
    Connecting,
    Reconnecting,
    Disconnected,
    NoAuthorizedDevice,
    NotSupported,
}

/// Which transport emitted a status change.
///
/// `RadioRemote` is the radio-bridge transport: its status reflects the
/// remote sensor link as seen through the bridge.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    Usb,
    RadioRemote,
    Bluetooth,
}

/// A single status assignment on one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub source: TransportKind,
    pub status: DeviceConnectionStatus,
    pub previous: DeviceConnectionStatus,
}

/// Owner of a transport's status value.
///
/// The current value lives in a `watch` channel so it can be read without
/// locking; every assignment (repeats included) is also broadcast as a
/// [`StatusChange`] so subscribers see the previous value alongside it.
#[derive(Debug)]
pub struct StatusPublisher {
    kind: TransportKind,
    current: watch::Sender<DeviceConnectionStatus>,
    changes: broadcast::Sender<StatusChange>,
}

impl StatusPublisher {
    pub fn new(kind: TransportKind, initial: DeviceConnectionStatus) -> Self {
        let (current, _) = watch::channel(initial);
        let (changes, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            kind,
            current,
            changes,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn get(&self) -> DeviceConnectionStatus {
        *self.current.borrow()
    }

    /// Assign a new status and broadcast the change.
    pub fn set(&self, status: DeviceConnectionStatus) -> StatusChange {
        let previous = self.current.send_replace(status);
        let change = StatusChange {
            source: self.kind,
            status,
            previous,
        };
        trace!(transport = %self.kind, %status, %previous, "status assigned");
        // No subscribers is fine: nobody is listening yet.
        let _ = self.changes.send(change);
        change
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    /// A receiver for the latest value only (no history).
    pub fn watch(&self) -> watch::Receiver<DeviceConnectionStatus> {
        self.current.subscribe()
    }
}
