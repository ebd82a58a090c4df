// HTTP flash-data fetching.
//
// Firmware images are served as plain text. A non-OK response and a
// network failure both surface as `Error::FlashData`, never as a device
// error.

use std::time::Duration;

use tracing::debug;
use url::Url;

use crate::error::Error;

/// Shared settings for building the HTTP client used to fetch hex files.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("mblink/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

/// Thin wrapper around a `reqwest::Client` for fetching firmware text.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HexFetcher {
    http: reqwest::Client,
}

impl HexFetcher {
    /// Build a fetcher from config.
    pub fn new(config: &FetchConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .build()?;
        Ok(Self { http })
    }

    /// Wrap an existing client (tests, custom TLS setups).
    pub fn from_reqwest(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Fetch a URL's body as text.
    pub async fn fetch_text(&self, url: &Url) -> Result<String, Error> {
        debug!(%url, "fetching flash data");
        let flash_data_err = |e: reqwest::Error| {
            if e.is_timeout() {
                Error::FlashDataTimeout { url: url.to_string() }
            } else {
                Error::FlashData {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        };

        let resp = self.http.get(url.clone()).send().await.map_err(flash_data_err)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::FlashData {
                url: url.to_string(),
                reason: format!("HTTP {status}"),
            });
        }

        resp.text().await.map_err(flash_data_err)
    }
}
