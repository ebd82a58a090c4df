// ── Firmware images ──
//
// Precompiled hex resolution by board version, and the flash-data sources
// handed to a USB transport's `flash()`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use url::Url;

use crate::board::BoardVersion;
use crate::error::Error;
use crate::fetch::HexFetcher;

/// Which precompiled firmware image to flash.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum HexType {
    /// Sensor firmware streaming over Bluetooth.
    Bluetooth,
    /// Remote sensor device in a radio-bridge pair.
    RadioRemote,
    /// Development build of the radio remote firmware.
    RadioRemoteDev,
    /// USB-attached bridge device relaying radio packets.
    RadioBridge,
    /// Single-device radio firmware reading its own sensors.
    RadioLocal,
}

/// Board version key used to pick an image. `Universal` images carry
/// variants for every revision and are resolved on the device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum HexVersion {
    V1,
    V2,
    #[strum(serialize = "universal")]
    Universal,
}

impl From<BoardVersion> for HexVersion {
    fn from(version: BoardVersion) -> Self {
        match version {
            BoardVersion::V1 => Self::V1,
            BoardVersion::V2 => Self::V2,
        }
    }
}

/// Resolve the firmware image path for a board version and hex type.
///
/// Paths are relative to the configured firmware base URL. Only the
/// Bluetooth image exists for every version key; the radio images are
/// V2-only and resolve to `None` elsewhere. `None` is a hard failure for
/// callers, never something to retry.
pub fn resolve_hex_url(version: HexVersion, hex_type: HexType) -> Option<&'static str> {
    match (hex_type, version) {
        (HexType::Bluetooth, HexVersion::V1) => Some("firmware/ml-microbit-cpp-version-combined.hex"),
        (HexType::Bluetooth, HexVersion::V2) => Some("firmware/MICROBIT.hex"),
        (HexType::Bluetooth, HexVersion::Universal) => Some("firmware/universal-hex.hex"),
        (HexType::RadioRemote, HexVersion::V2) => Some("firmware/radio-remote-v0.2.1.hex"),
        (HexType::RadioRemoteDev, HexVersion::V2) => Some("firmware/radio-remote-v0.2.1-dev.hex"),
        (HexType::RadioBridge, HexVersion::V2) => Some("firmware/radio-bridge-v0.2.1.hex"),
        (HexType::RadioLocal, HexVersion::V2) => Some("firmware/local-sensors-v0.2.1.hex"),
        _ => None,
    }
}

// ── Flash data sources ───────────────────────────────────────────────

/// Supplies the image text for a given board once the transport has
/// identified it.
#[async_trait]
pub trait FlashDataSource: Send + Sync {
    async fn hex_for(&self, version: BoardVersion) -> Result<String, Error>;

    /// Human-readable label used in logs and download file names.
    fn label(&self) -> String;
}

/// A user program already built into a hex image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HexData {
    pub name: String,
    pub hex: String,
}

#[async_trait]
impl FlashDataSource for HexData {
    async fn hex_for(&self, _version: BoardVersion) -> Result<String, Error> {
        Ok(self.hex.clone())
    }

    fn label(&self) -> String {
        self.name.clone()
    }
}

/// A precompiled image fetched over HTTP on demand.
#[derive(Debug, Clone)]
pub struct RemoteHex {
    fetcher: HexFetcher,
    base_url: Url,
    hex_type: HexType,
}

impl RemoteHex {
    pub fn new(fetcher: HexFetcher, base_url: Url, hex_type: HexType) -> Self {
        Self {
            fetcher,
            base_url,
            hex_type,
        }
    }

    pub fn hex_type(&self) -> HexType {
        self.hex_type
    }

    /// Absolute URL of the image for `version`, or `UnsupportedFirmware`.
    pub fn url_for(&self, version: HexVersion) -> Result<Url, Error> {
        let path = resolve_hex_url(version, self.hex_type).ok_or(Error::UnsupportedFirmware {
            version,
            hex_type: self.hex_type,
        })?;
        Ok(self.base_url.join(path)?)
    }

    /// Fetch the image for an explicit version key (including `Universal`).
    pub async fn fetch(&self, version: HexVersion) -> Result<String, Error> {
        let url = self.url_for(version)?;
        self.fetcher.fetch_text(&url).await
    }
}

#[async_trait]
impl FlashDataSource for RemoteHex {
    async fn hex_for(&self, version: BoardVersion) -> Result<String, Error> {
        self.fetch(version.into()).await
    }

    fn label(&self) -> String {
        self.hex_type.to_string()
    }
}

// ── Libraries ────────────────────────────────────────────────────────

/// Hands out a flash-data source for each precompiled image type.
pub trait HexLibrary: Send + Sync {
    fn source(&self, hex_type: HexType) -> Box<dyn FlashDataSource>;
}

/// Precompiled images served under a base URL.
#[derive(Debug, Clone)]
pub struct RemoteHexLibrary {
    fetcher: HexFetcher,
    base_url: Url,
}

impl RemoteHexLibrary {
    pub fn new(fetcher: HexFetcher, base_url: Url) -> Self {
        Self { fetcher, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

impl HexLibrary for RemoteHexLibrary {
    fn source(&self, hex_type: HexType) -> Box<dyn FlashDataSource> {
        Box::new(RemoteHex::new(
            self.fetcher.clone(),
            self.base_url.clone(),
            hex_type,
        ))
    }
}
