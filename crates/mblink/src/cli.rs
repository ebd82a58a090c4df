//! Clap derive structures for the `mblink` CLI.
//!
//! Defines the complete command tree, global flags, and shared types.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use mblink_api::{HexType, HexVersion};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// mblink -- micro:bit connection toolkit
#[derive(Debug, Parser)]
#[command(
    name = "mblink",
    version,
    about = "Resolve micro:bit firmware and simulate connection sessions",
    long_about = "Tools around the micro:bit connection core.\n\n\
        Resolves and fetches the precompiled sensor firmware, derives the\n\
        Bluetooth name a micro:bit advertises, and replays connection\n\
        scenarios against simulated USB, Bluetooth and radio-bridge links.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "MBLINK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "MBLINK_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve, list and download precompiled firmware
    #[command(alias = "fw")]
    Firmware(FirmwareArgs),

    /// Print the Bluetooth name a micro:bit advertises
    Name(NameArgs),

    /// Replay a connection scenario against simulated devices
    #[command(alias = "sim")]
    Simulate(SimulateArgs),

    /// Manage configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Firmware ─────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct FirmwareArgs {
    #[command(subcommand)]
    pub command: FirmwareCommand,
}

#[derive(Debug, Subcommand)]
pub enum FirmwareCommand {
    /// Print the URL of one firmware image
    Resolve(FirmwareSelect),

    /// Show every board / firmware combination
    #[command(alias = "ls")]
    List,

    /// Download one firmware image
    Fetch {
        #[command(flatten)]
        select: FirmwareSelect,

        /// Write the image here instead of stdout
        #[arg(long, short = 'O')]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
pub struct FirmwareSelect {
    /// Board version key
    #[arg(long, short = 'b')]
    pub board: BoardArg,

    /// Firmware image type
    #[arg(long = "type", short = 't', value_name = "TYPE")]
    pub hex_type: HexTypeArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BoardArg {
    V1,
    V2,
    Universal,
}

impl From<BoardArg> for HexVersion {
    fn from(board: BoardArg) -> Self {
        match board {
            BoardArg::V1 => Self::V1,
            BoardArg::V2 => Self::V2,
            BoardArg::Universal => Self::Universal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HexTypeArg {
    Bluetooth,
    RadioRemote,
    RadioRemoteDev,
    RadioBridge,
    RadioLocal,
}

impl From<HexTypeArg> for HexType {
    fn from(arg: HexTypeArg) -> Self {
        match arg {
            HexTypeArg::Bluetooth => Self::Bluetooth,
            HexTypeArg::RadioRemote => Self::RadioRemote,
            HexTypeArg::RadioRemoteDev => Self::RadioRemoteDev,
            HexTypeArg::RadioBridge => Self::RadioBridge,
            HexTypeArg::RadioLocal => Self::RadioLocal,
        }
    }
}

// ── Name ─────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct NameArgs {
    /// Device id (decimal or 0x-prefixed hex) or a full USB serial number
    pub device: String,
}

// ── Simulate ─────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Scenario to replay
    pub scenario: Scenario,

    /// Directory for manual downloads (defaults to the configured one)
    #[arg(long)]
    pub download_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Flash the Bluetooth firmware over USB, then pair
    Bluetooth,
    /// Flash remote and bridge, then link them over serial
    Radio,
    /// Radio session whose bridge micro:bit is unplugged
    RadioBridgeLost,
    /// Bluetooth link drops and the explicit reconnect fails
    BluetoothReconnectFail,
    /// Download a program to a second micro:bit during a radio session
    DownloadDifferent,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,

    /// Show the effective configuration
    Show,

    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
