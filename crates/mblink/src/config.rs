//! CLI configuration: thin wrapper around `mblink_config` shared types.
//!
//! Adds `--config` path resolution on top of the shared loader.

use std::path::PathBuf;

use mblink_core::SessionConfig;

use crate::cli::GlobalOpts;
use crate::error::CliError;

// ── Re-exports from shared crate ────────────────────────────────────

pub use mblink_config::{Config, load_config_from, save_config_to};

// ── CLI-specific helpers ────────────────────────────────────────────

/// The config file in effect: `--config` / `MBLINK_CONFIG`, else the
/// platform default.
pub fn active_path(global: &GlobalOpts) -> PathBuf {
    global.config.clone().unwrap_or_else(mblink_config::config_path)
}

/// Load the effective configuration.
pub fn load(global: &GlobalOpts) -> Result<Config, CliError> {
    Ok(load_config_from(&active_path(global))?)
}

/// Load and validate into the core's session settings.
pub fn session_config(global: &GlobalOpts) -> Result<(Config, SessionConfig), CliError> {
    let cfg = load(global)?;
    let session = cfg.to_session_config()?;
    Ok((cfg, session))
}
