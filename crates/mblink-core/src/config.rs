// ── Runtime session configuration ──
//
// Describes how a session fetches firmware and which optional steps it
// shows. Never touches disk: the CLI builds a `SessionConfig` from its own
// config file and hands it in.

use std::time::Duration;

use url::Url;

use crate::model::ConnectionType;

/// Where precompiled firmware images are served from.
pub const DEFAULT_FIRMWARE_BASE_URL: &str = "https://ml.microbit.org/";

/// Configuration for a single connection session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Base URL the firmware paths are resolved against.
    pub firmware_base_url: Url,
    /// Timeout for fetching a firmware image.
    pub fetch_timeout: Duration,
    /// Flash the development build of the radio remote firmware.
    pub use_dev_radio_remote: bool,
    /// Show the help step before downloading a program.
    pub show_download_help: bool,
    /// Connection type a new session starts with.
    pub default_connection_type: ConnectionType,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            firmware_base_url: Url::parse(DEFAULT_FIRMWARE_BASE_URL)
                .unwrap_or_else(|_| unreachable!("default firmware URL is valid")),
            fetch_timeout: Duration::from_secs(30),
            use_dev_radio_remote: false,
            show_download_help: true,
            default_connection_type: ConnectionType::Bluetooth,
        }
    }
}
