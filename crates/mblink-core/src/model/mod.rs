// ── Session domain model ──
//
// Every type in this module is transport-agnostic: what the rest of the
// application displays and decides on, never what a transport reports.

pub mod download;
pub mod flow;
pub mod status;

// ── Re-exports ──────────────────────────────────────────────────────

pub use download::{DownloadState, DownloadStep, MicrobitToFlash};
pub use flow::{ConnectionFlowStep, ConnectionStage, TransportSupport};
pub use status::{ConnectResult, ConnectionFlowType, ConnectionStatus, ConnectionType, SessionFlags};
