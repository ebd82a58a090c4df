//! Micro:bit name lookup.

use serde::Serialize;

use mblink_api::{BoardVersion, device_id_from_serial, device_id_to_microbit_name};

use crate::cli::{GlobalOpts, NameArgs};
use crate::error::CliError;
use crate::output;

/// Length of a DAPLink USB serial number.
const SERIAL_LEN: usize = 24;

#[derive(Debug, Serialize)]
struct NameInfo {
    device_id: u32,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    board: Option<BoardVersion>,
}

pub fn handle(args: &NameArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let input = args.device.trim();
    let (device_id, board) = if input.len() == SERIAL_LEN {
        let id = device_id_from_serial(input).ok_or_else(|| invalid(input))?;
        (id, BoardVersion::from_serial_number(input))
    } else {
        (parse_device_id(input).ok_or_else(|| invalid(input))?, None)
    };

    let info = NameInfo {
        device_id,
        name: device_id_to_microbit_name(device_id),
        board,
    };
    let out = output::render_single(
        global.output,
        &info,
        |i| match i.board {
            Some(board) => format!("{} ({board}, device id {})", i.name, i.device_id),
            None => i.name.clone(),
        },
        |i| i.name.clone(),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}

fn parse_device_id(input: &str) -> Option<u32> {
    match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => input.parse().ok(),
    }
}

fn invalid(input: &str) -> CliError {
    CliError::Validation {
        field: "device".into(),
        reason: format!("expected a device id or a {SERIAL_LEN}-digit serial number, got '{input}'"),
    }
}
