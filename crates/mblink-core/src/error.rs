// ── Core error types ──
//
// Errors from mblink-core. Connection and flashing failures are NOT errors
// here: the façade resolves them to `ConnectResult` values and the reducer
// turns link failures into `ConnectionStatus` values. What remains is
// controller misuse, the manual-download sink and configuration.

use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Controller misuse ────────────────────────────────────────────
    #[error("Another connection action is already in progress")]
    Busy,

    #[error("Cannot {action} from step {step}")]
    InvalidStep { action: &'static str, step: String },

    #[error("A temporary USB connection is already in use")]
    UsbBorrowed,

    #[error("No {what} available")]
    MissingDevice { what: &'static str },

    #[error("Operation not supported: {operation}")]
    Unsupported { operation: String },

    // ── Environment ──────────────────────────────────────────────────
    #[error("Cannot save {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub(crate) fn invalid_step(action: &'static str, step: impl ToString) -> Self {
        Self::InvalidStep {
            action,
            step: step.to_string(),
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────
//
// Only used where a transport error escapes outside a façade operation
// (building the HTTP client, for instance).

impl From<mblink_api::Error> for CoreError {
    fn from(err: mblink_api::Error) -> Self {
        match err {
            mblink_api::Error::Http(e) => CoreError::Config {
                message: format!("Cannot build HTTP client: {e}"),
            },
            mblink_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            mblink_api::Error::UnsupportedFirmware { version, hex_type } => {
                CoreError::Unsupported {
                    operation: format!("{hex_type} firmware on board {version}"),
                }
            }
            mblink_api::Error::NotConnected { transport } => CoreError::MissingDevice {
                what: transport,
            },
            other => CoreError::Internal(other.to_string()),
        }
    }
}
