// ── Board identification ──
//
// Hardware revision detection from the DAPLink serial number, and the
// five-letter "friendly name" a micro:bit advertises over Bluetooth.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// micro:bit hardware revision.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum BoardVersion {
    V1,
    V2,
}

impl BoardVersion {
    /// Detect the board revision from a DAPLink serial number.
    ///
    /// The first four characters are the board ID: `9900`/`9901` are V1,
    /// `9903`-`9906` are V2. Anything else is not a micro:bit.
    pub fn from_serial_number(serial: &str) -> Option<Self> {
        match serial.get(..4)? {
            "9900" | "9901" => Some(Self::V1),
            "9903" | "9904" | "9905" | "9906" => Some(Self::V2),
            _ => None,
        }
    }

    /// Whether user programs built for the ML runtime can run on this board.
    pub fn supports_ml_runtime(self) -> bool {
        matches!(self, Self::V2)
    }
}

/// Device id as reported by the USB transport: the last eight hex digits
/// of the serial number.
pub fn device_id_from_serial(serial: &str) -> Option<u32> {
    let start = serial.len().checked_sub(8)?;
    u32::from_str_radix(serial.get(start..)?, 16).ok()
}

const NAME_LENGTH: usize = 5;
const CODE_LETTERS: u32 = 5;
const CODEBOOK: [[char; CODE_LETTERS as usize]; NAME_LENGTH] = [
    ['z', 'v', 'g', 'p', 't'],
    ['u', 'o', 'i', 'e', 'a'],
    ['z', 'v', 'g', 'p', 't'],
    ['u', 'o', 'i', 'e', 'a'],
    ['z', 'v', 'g', 'p', 't'],
];

/// Derive the friendly name (e.g. `"zuzuv"`) a micro:bit advertises over
/// Bluetooth from its 32-bit device id.
///
/// Used to pre-fill the Bluetooth name filter after the device has been
/// seen over USB, so the user is not asked to pick it again.
pub fn device_id_to_microbit_name(device_id: u32) -> String {
    let mut name = ['z'; NAME_LENGTH];
    let mut n = u64::from(device_id);
    let mut d = u64::from(CODE_LETTERS);
    let mut ld = 1_u64;
    for (i, letters) in CODEBOOK.iter().enumerate() {
        let h = (n % d) / ld;
        n -= h;
        d *= u64::from(CODE_LETTERS);
        ld *= u64::from(CODE_LETTERS);
        // h < CODE_LETTERS by construction
        let idx = usize::try_from(h).unwrap_or(0);
        name[NAME_LENGTH - i - 1] = letters[idx];
    }
    name.iter().collect()
}
