//! Firmware command handlers.

use std::io::Write;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use strum::IntoEnumIterator;
use tabled::Tabled;
use url::Url;

use mblink_api::{FetchConfig, HexFetcher, HexType, HexVersion, RemoteHex, resolve_hex_url};

use crate::cli::{FirmwareArgs, FirmwareCommand, FirmwareSelect, GlobalOpts};
use crate::config;
use crate::error::CliError;
use crate::output;

// ── Table row ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct FirmwareEntry {
    board: HexVersion,
    hex_type: HexType,
    url: Option<String>,
}

#[derive(Tabled)]
struct FirmwareRow {
    #[tabled(rename = "Board")]
    board: String,
    #[tabled(rename = "Type")]
    hex_type: String,
    #[tabled(rename = "URL")]
    url: String,
}

impl From<&FirmwareEntry> for FirmwareRow {
    fn from(e: &FirmwareEntry) -> Self {
        Self {
            board: e.board.to_string(),
            hex_type: e.hex_type.to_string(),
            url: e.url.clone().unwrap_or_else(|| "-".into()),
        }
    }
}

fn entry(base: &Url, board: HexVersion, hex_type: HexType) -> Result<FirmwareEntry, CliError> {
    let url = resolve_hex_url(board, hex_type)
        .map(|path| base.join(path))
        .transpose()
        .map_err(|e| CliError::Validation {
            field: "firmware.base_url".into(),
            reason: e.to_string(),
        })?;
    Ok(FirmwareEntry {
        board,
        hex_type,
        url: url.map(String::from),
    })
}

// ── Handler ─────────────────────────────────────────────────────────

pub async fn handle(args: FirmwareArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let (cfg, session) = config::session_config(global)?;
    let base = &session.firmware_base_url;

    match args.command {
        FirmwareCommand::Resolve(select) => {
            let (board, hex_type) = keys(&select);
            let found = entry(base, board, hex_type)?;
            let url = found.url.clone().ok_or_else(|| CliError::UnsupportedFirmware {
                board: board.to_string(),
                hex_type: hex_type.to_string(),
            })?;
            let out = output::render_single(global.output, &found, |_| url.clone(), |_| url.clone())?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        FirmwareCommand::List => {
            let all = HexVersion::iter()
                .flat_map(|board| HexType::iter().map(move |hex_type| (board, hex_type)))
                .map(|(board, hex_type)| entry(base, board, hex_type))
                .collect::<Result<Vec<_>, _>>()?;
            let out = output::render_list(global.output, &all, |e| FirmwareRow::from(e), |e| {
                format!(
                    "{} {} {}",
                    e.board,
                    e.hex_type,
                    e.url.as_deref().unwrap_or("-")
                )
            })?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        FirmwareCommand::Fetch { select, out } => {
            let (board, hex_type) = keys(&select);
            let fetcher = HexFetcher::new(&FetchConfig {
                timeout: session.fetch_timeout,
                ..FetchConfig::default()
            })
            .map_err(|e| CliError::from_api(e, cfg.firmware.timeout))?;
            let remote = RemoteHex::new(fetcher, base.clone(), hex_type);

            let spinner = spinner(global.quiet, &format!("Fetching {hex_type} firmware for {board}"));
            let result = remote.fetch(board).await;
            spinner.finish_and_clear();
            let hex = result.map_err(|e| CliError::from_api(e, cfg.firmware.timeout))?;

            match out {
                Some(path) => {
                    tokio::fs::write(&path, &hex).await?;
                    tracing::info!(path = %path.display(), bytes = hex.len(), "firmware saved");
                    if !global.quiet {
                        eprintln!("Saved {hex_type} firmware for {board} to {}", path.display());
                    }
                }
                None => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(hex.as_bytes())?;
                    stdout.flush()?;
                }
            }
            Ok(())
        }
    }
}

fn keys(select: &FirmwareSelect) -> (HexVersion, HexType) {
    (select.board.into(), select.hex_type.into())
}

fn spinner(quiet: bool, message: &str) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner().with_message(message.to_owned());
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
