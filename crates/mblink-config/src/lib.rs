//! Shared configuration for the mblink tools.
//!
//! A TOML file under the platform config dir, layered over built-in
//! defaults and `MBLINK_`-prefixed environment variables, translated into
//! `mblink_core::SessionConfig`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use mblink_core::{ConnectionType, DEFAULT_FIRMWARE_BASE_URL, SessionConfig};

/// Environment variables with this prefix override file values. Nested
/// keys are separated by a double underscore: `MBLINK_FIRMWARE__BASE_URL`.
pub const ENV_PREFIX: &str = "MBLINK_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,

    #[serde(default)]
    pub firmware: Firmware,

    #[serde(default)]
    pub session: Session,
}

/// Output defaults for the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default = "default_color")]
    pub color: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            color: default_color(),
        }
    }
}

fn default_output() -> String {
    "table".into()
}
fn default_color() -> String {
    "auto".into()
}

/// Where firmware images come from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Firmware {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Fetch timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Flash the development radio remote build.
    #[serde(default)]
    pub dev_radio_remote: bool,
}

impl Default for Firmware {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout: default_timeout(),
            dev_radio_remote: false,
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_FIRMWARE_BASE_URL.into()
}
fn default_timeout() -> u64 {
    30
}

/// Session behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Session {
    /// "bluetooth" or "radio".
    #[serde(default = "default_connection_type")]
    pub connection_type: String,

    #[serde(default = "default_true")]
    pub show_download_help: bool,

    /// Where programs are saved when they cannot be flashed over USB.
    pub download_dir: Option<PathBuf>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            connection_type: default_connection_type(),
            show_download_help: true,
            download_dir: None,
        }
    }
}

fn default_connection_type() -> String {
    "bluetooth".into()
}
fn default_true() -> bool {
    true
}

impl Config {
    /// Validate and translate into the core's runtime settings.
    pub fn to_session_config(&self) -> Result<SessionConfig, ConfigError> {
        let firmware_base_url: url::Url =
            self.firmware
                .base_url
                .parse()
                .map_err(|_| ConfigError::Validation {
                    field: "firmware.base_url".into(),
                    reason: format!("invalid URL: {}", self.firmware.base_url),
                })?;
        if firmware_base_url.cannot_be_a_base() {
            return Err(ConfigError::Validation {
                field: "firmware.base_url".into(),
                reason: format!("not a base URL: {firmware_base_url}"),
            });
        }

        let default_connection_type = ConnectionType::from_str(&self.session.connection_type)
            .map_err(|_| ConfigError::Validation {
                field: "session.connection_type".into(),
                reason: format!(
                    "expected 'bluetooth' or 'radio', got '{}'",
                    self.session.connection_type
                ),
            })?;

        if self.firmware.timeout == 0 {
            return Err(ConfigError::Validation {
                field: "firmware.timeout".into(),
                reason: "must be at least 1 second".into(),
            });
        }

        Ok(SessionConfig {
            firmware_base_url,
            fetch_timeout: Duration::from_secs(self.firmware.timeout),
            use_dev_radio_remote: self.firmware.dev_radio_remote,
            show_download_help: self.session.show_download_help,
            default_connection_type,
        })
    }

    /// Directory for manual downloads, falling back to the platform
    /// download or home directory.
    pub fn download_dir(&self) -> PathBuf {
        self.session.download_dir.clone().unwrap_or_else(|| {
            directories::UserDirs::new()
                .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "mblink", "mblink").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("mblink");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from an explicit file. A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if it can't be read.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

/// Serialize config to TOML and write it to `path`.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}
