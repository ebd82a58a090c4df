// Integration tests for HTTP flash-data fetching using wiremock.
#![allow(clippy::unwrap_used)]

use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mblink_api::{
    BoardVersion, Error, FetchConfig, FlashDataSource, HexFetcher, HexType, HexVersion, RemoteHex,
};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup(hex_type: HexType) -> (MockServer, RemoteHex) {
    let server = MockServer::start().await;
    let base = Url::parse(&format!("{}/", server.uri())).unwrap();
    let remote = RemoteHex::new(HexFetcher::from_reqwest(reqwest::Client::new()), base, hex_type);
    (server, remote)
}

// ── Happy path ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_fetches_hex_for_detected_board() {
    let (server, remote) = setup(HexType::RadioBridge).await;

    Mock::given(method("GET"))
        .and(path("/firmware/radio-bridge-v0.2.1.hex"))
        .respond_with(ResponseTemplate::new(200).set_body_string(":020000040000FA\n"))
        .mount(&server)
        .await;

    let hex = remote.hex_for(BoardVersion::V2).await.unwrap();
    assert_eq!(hex, ":020000040000FA\n");
    assert_eq!(remote.label(), "radio-bridge");
}

#[tokio::test]
async fn test_universal_bluetooth_hex() {
    let (server, remote) = setup(HexType::Bluetooth).await;

    Mock::given(method("GET"))
        .and(path("/firmware/universal-hex.hex"))
        .respond_with(ResponseTemplate::new(200).set_body_string("universal"))
        .mount(&server)
        .await;

    assert_eq!(remote.fetch(HexVersion::Universal).await.unwrap(), "universal");
}

// ── Failures ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_non_ok_status_is_flash_data_error() {
    let (server, remote) = setup(HexType::Bluetooth).await;

    Mock::given(method("GET"))
        .and(path("/firmware/MICROBIT.hex"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = remote.hex_for(BoardVersion::V2).await.unwrap_err();
    assert!(err.is_flash_data(), "expected flash data error, got {err:?}");
    assert!(err.device_code().is_none());
    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn test_v1_radio_firmware_is_unsupported_without_request() {
    let (server, remote) = setup(HexType::RadioRemote).await;

    let err = remote.hex_for(BoardVersion::V1).await.unwrap_err();
    assert!(matches!(
        err,
        Error::UnsupportedFirmware {
            version: HexVersion::V1,
            hex_type: HexType::RadioRemote
        }
    ));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_network_failure_is_flash_data_error() {
    let base = Url::parse("http://127.0.0.1:9/").unwrap();
    let remote = RemoteHex::new(
        HexFetcher::from_reqwest(reqwest::Client::new()),
        base,
        HexType::Bluetooth,
    );

    let err = remote.fetch(HexVersion::V2).await.unwrap_err();
    assert!(err.is_flash_data());
}

#[tokio::test]
async fn test_slow_server_is_flash_data_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/firmware/MICROBIT.hex"))
        .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(5)))
        .mount(&server)
        .await;

    let fetcher = HexFetcher::new(&FetchConfig {
        timeout: std::time::Duration::from_millis(100),
        ..FetchConfig::default()
    })
    .unwrap();
    let base = Url::parse(&format!("{}/", server.uri())).unwrap();
    let remote = RemoteHex::new(fetcher, base, HexType::Bluetooth);

    let err = remote.fetch(HexVersion::V2).await.unwrap_err();
    assert!(matches!(err, Error::FlashDataTimeout { .. }), "got {err:?}");
    assert!(err.is_flash_data());
}
