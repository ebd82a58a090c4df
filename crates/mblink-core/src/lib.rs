//! Connection orchestration for micro:bit sessions.
//!
//! - **[`ConnectActions`]**: one façade over the USB, Bluetooth and
//!   radio-bridge transports. Every flash or connect resolves to a
//!   [`ConnectResult`]; transport errors never get past it.
//!
//! - **[`reducer`]**: the pure function turning one transport status change
//!   into the session's [`ConnectionStatus`], driven by [`SessionFlags`].
//!
//! - **[`flow`]**: step sequencing for the connection dialog
//!   ([`ConnectionStage`] / [`ConnectionFlowStep`]).
//!
//! - **[`SessionController`]**: owns status, stage and flags, pumps status
//!   changes through the reducer and runs the transport work each step
//!   asks for.
//!
//! - **[`DownloadPipeline`]**: puts a user program on the session's
//!   micro:bit or on another one through a temporary USB handle, falling
//!   back to a [`ManualDownload`].

pub mod actions;
pub mod config;
pub mod controller;
pub mod download;
pub mod error;
pub mod flow;
pub mod manual;
pub mod model;
pub mod reducer;

// ── Primary re-exports ──────────────────────────────────────────────
pub use actions::{
    ConnectActions, HexSource, ListenerId, SameDeviceFn, Transports, UsbConnection,
    connect_result_for,
};
pub use config::{DEFAULT_FIRMWARE_BASE_URL, SessionConfig};
pub use controller::SessionController;
pub use download::{DownloadContext, DownloadPipeline, ReleaseFn, TemporaryUsb};
pub use error::CoreError;
pub use manual::{ManualDownload, SaveToDirectory};
pub use reducer::{StatusInput, StatusUpdate, next_status};

pub use model::{
    ConnectResult, ConnectionFlowStep, ConnectionFlowType, ConnectionStage, ConnectionStatus,
    ConnectionType, DownloadState, DownloadStep, MicrobitToFlash, SessionFlags, TransportSupport,
};
