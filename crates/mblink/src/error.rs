//! CLI error types with miette diagnostics.
//!
//! Maps transport, core and config errors into user-facing errors with
//! actionable help text and distinct exit codes.

use miette::Diagnostic;
use thiserror::Error;

use mblink_config::ConfigError;
use mblink_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const UNSUPPORTED: i32 = 5;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Firmware ─────────────────────────────────────────────────────

    #[error("No {hex_type} firmware exists for board {board}")]
    #[diagnostic(
        code(mblink::unsupported_firmware),
        help("Radio firmware needs a V2 board. Run: mblink firmware list")
    )]
    UnsupportedFirmware { board: String, hex_type: String },

    #[error("Could not fetch firmware from {url}: {reason}")]
    #[diagnostic(
        code(mblink::flash_data),
        help(
            "Check the firmware server is reachable.\n\
             Override it with [firmware] base_url in: mblink config path"
        )
    )]
    FlashData { url: String, reason: String },

    #[error("Fetching firmware from {url} timed out after {seconds}s")]
    #[diagnostic(
        code(mblink::timeout),
        help("Raise [firmware] timeout in your config or check the server.")
    )]
    Timeout { url: String, seconds: u64 },

    // ── Devices ──────────────────────────────────────────────────────

    #[error("{what} not found")]
    #[diagnostic(code(mblink::not_found))]
    NotFound { what: String },

    #[error("Operation '{operation}' is not supported")]
    #[diagnostic(code(mblink::unsupported))]
    Unsupported { operation: String },

    #[error("Scenario '{scenario}' did not finish: {reason}")]
    #[diagnostic(code(mblink::scenario))]
    Scenario { scenario: String, reason: String },

    // ── Validation ───────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(mblink::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Configuration file already exists at {path}")]
    #[diagnostic(
        code(mblink::config_exists),
        help("Pass --force to overwrite it.")
    )]
    ConfigExists { path: String },

    #[error(transparent)]
    #[diagnostic(code(mblink::config))]
    Config(Box<figment::Error>),

    #[error("Failed to write configuration: {0}")]
    #[diagnostic(code(mblink::config_write))]
    ConfigWrite(#[from] toml::ser::Error),

    // ── Internal ─────────────────────────────────────────────────────

    #[error("{0}")]
    #[diagnostic(code(mblink::internal))]
    Internal(String),

    // ── IO / Serialization ────────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    #[diagnostic(code(mblink::json))]
    Json(#[from] serde_json::Error),
}

impl From<figment::Error> for CliError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::FlashData { .. } => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::UnsupportedFirmware { .. } | Self::Unsupported { .. } => exit_code::UNSUPPORTED,
            Self::Validation { .. } | Self::ConfigExists { .. } | Self::Config(_) => {
                exit_code::USAGE
            }
            _ => exit_code::GENERAL,
        }
    }

    /// Translate a transport error, filling in the configured timeout.
    pub fn from_api(err: mblink_api::Error, timeout_secs: u64) -> Self {
        match err {
            mblink_api::Error::UnsupportedFirmware { version, hex_type } => {
                Self::UnsupportedFirmware {
                    board: version.to_string(),
                    hex_type: hex_type.to_string(),
                }
            }
            mblink_api::Error::FlashData { url, reason } => Self::FlashData { url, reason },
            mblink_api::Error::FlashDataTimeout { url } => Self::Timeout {
                url,
                seconds: timeout_secs,
            },
            mblink_api::Error::InvalidUrl(e) => Self::Validation {
                field: "firmware.base_url".into(),
                reason: e.to_string(),
            },
            mblink_api::Error::NotConnected { transport } => Self::NotFound {
                what: format!("Device on {transport}"),
            },
            other => Self::Internal(other.to_string()),
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Unsupported { operation } => CliError::Unsupported { operation },
            CoreError::MissingDevice { what } => CliError::NotFound {
                what: what.to_owned(),
            },
            CoreError::Config { message } => CliError::Validation {
                field: "config".into(),
                reason: message,
            },
            CoreError::Io { source, .. } => CliError::Io(source),
            other @ (CoreError::Busy
            | CoreError::InvalidStep { .. }
            | CoreError::UsbBorrowed
            | CoreError::Internal(_)) => CliError::Internal(other.to_string()),
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::Serialization(e) => CliError::ConfigWrite(e),
            ConfigError::Figment(e) => CliError::Config(e),
            ConfigError::Io(e) => CliError::Io(e),
        }
    }
}
