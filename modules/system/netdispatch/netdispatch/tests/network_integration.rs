use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use httpmock::prelude::*;
use netdispatch::config::NetworkSettings;
use netdispatch::{DispatchConfig, DispatchError, DispatchExt, DispatchOptions, NetworkInterface};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn network() -> NetworkInterface {
    let mut config = DispatchConfig::default();
    config.retry.max_retries = 0;
    NetworkInterface::in_memory(config).unwrap()
}

async fn read_head(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if socket.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// A one-shot HTTP proxy: answers the first `CONNECT` with `answer` and, on
/// `200`, splices the client to `upstream`. Returns the received head.
async fn fake_proxy(answer: &'static str, upstream: SocketAddr) -> (SocketAddr, Arc<Mutex<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(String::new()));
    let record = seen.clone();
    tokio::spawn(async move {
        let (mut client, _) = listener.accept().await.unwrap();
        *record.lock() = read_head(&mut client).await;
        client.write_all(answer.as_bytes()).await.unwrap();
        if answer.starts_with("HTTP/1.1 200") {
            let mut server = TcpStream::connect(upstream).await.unwrap();
            let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
        }
    });
    (addr, seen)
}

#[tokio::test]
async fn test_api_request_round_trip() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/versions")
                .header("host", format!("127.0.0.1:{}", server.port()))
                .header_exists("user-agent");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"latest": "1.21"}));
        })
        .await;

    let network = network();
    let resp = network
        .api_dispatcher()
        .request(DispatchOptions::get(&server.url("/v1/versions")).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status, StatusCode::OK);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["latest"], json!("1.21"));
    mock.assert_async().await;

    let status = network.network_status();
    assert_eq!(status.api.len(), 1);
    assert!(status.download.is_empty());
}

#[tokio::test]
async fn test_post_body_is_sent() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/auth/login")
                .json_body(json!({"user": "steve"}));
            then.status(201).body("created");
        })
        .await;

    let opts = DispatchOptions::builder()
        .url(&server.url("/auth/login"))
        .unwrap()
        .method(Method::POST)
        .header("content-type", "application/json")
        .body(r#"{"user":"steve"}"#)
        .build()
        .unwrap();
    let resp = network().api_dispatcher().request(opts).await.unwrap();

    assert_eq!(resp.status, StatusCode::CREATED);
    assert_eq!(resp.text(), "created");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_fresh_api_response_is_served_from_cache() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/manifest.json");
            then.status(200)
                .header("cache-control", "max-age=300")
                .header("etag", "\"m1\"")
                .body("{\"files\":[]}");
        })
        .await;

    let network = network();
    let url = server.url("/manifest.json");
    let first = network
        .api_dispatcher()
        .request(DispatchOptions::get(&url).unwrap())
        .await
        .unwrap();
    let second = network
        .api_dispatcher()
        .request(DispatchOptions::get(&url).unwrap())
        .await
        .unwrap();

    assert_eq!(first.body, second.body);
    assert_eq!(second.headers.first("etag"), Some("\"m1\""));
    assert_eq!(mock.hits_async().await, 1);
}

#[tokio::test]
async fn test_downloads_skip_cache_and_use_download_pools() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/libraries/lwjgl.jar");
            then.status(200)
                .header("cache-control", "max-age=300")
                .body(vec![7u8; 2048]);
        })
        .await;

    let network = network();
    let url = server.url("/libraries/lwjgl.jar");
    for _ in 0..2 {
        let resp = network
            .download_dispatcher()
            .request(DispatchOptions::get(&url).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.body.len(), 2048);
    }

    assert_eq!(mock.hits_async().await, 2);
    let status = network.network_status();
    assert_eq!(status.download.len(), 1);
    assert!(status.api.is_empty());
}

#[tokio::test]
async fn test_slow_download_does_not_block_api_requests() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/assets/big.zip");
            then.status(200).delay(Duration::from_secs(2)).body("zip");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/news");
            then.status(200).body("news");
        })
        .await;

    // One socket per origin in each pool.
    let mut config = DispatchConfig::default();
    config.retry.max_retries = 0;
    config.settings.max_sockets = 1;
    let network = NetworkInterface::in_memory(config).unwrap();

    let mut downloads = Vec::new();
    for _ in 0..2 {
        let download = network.download_dispatcher();
        let slow = DispatchOptions::get(&server.url("/assets/big.zip")).unwrap();
        downloads.push(tokio::spawn(async move { download.request(slow).await }));
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let news = tokio::time::timeout(
        Duration::from_secs(1),
        network
            .api_dispatcher()
            .request(DispatchOptions::get(&server.url("/v1/news")).unwrap()),
    )
    .await
    .expect("api request stalled behind the download")
    .unwrap();
    assert_eq!(news.text(), "news");

    let status = network.network_status();
    let origin = server.base_url();
    let download = status.download[&origin];
    assert_eq!(download.connected, 1);
    assert_eq!(download.running, 1);
    assert_eq!(download.queued, 1);
    assert_eq!(status.api[&origin].connected, 1);

    for pending in downloads {
        assert_eq!(pending.await.unwrap().unwrap().text(), "zip");
    }
}

#[tokio::test]
async fn test_destroyed_pool_is_recreated_on_demand() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/ping");
            then.status(204);
        })
        .await;

    let network = network();
    let url = server.url("/ping");
    network
        .api_dispatcher()
        .request(DispatchOptions::get(&url).unwrap())
        .await
        .unwrap();
    assert!(network.destroy_pool(&url::Url::parse(&server.base_url()).unwrap()));
    assert!(network.network_status().api.is_empty());

    network
        .api_dispatcher()
        .request(DispatchOptions::get(&url).unwrap())
        .await
        .unwrap();
    assert_eq!(network.network_status().api.len(), 1);
    assert_eq!(mock.hits_async().await, 2);
}

#[tokio::test]
async fn test_caller_proxy_authorization_is_rejected() {
    let opts = DispatchOptions::builder()
        .url("http://127.0.0.1:9/x")
        .unwrap()
        .header("proxy-authorization", "Basic Zm9vOmJhcg==")
        .build()
        .unwrap();
    let err = network().api_dispatcher().request(opts).await.unwrap_err();
    assert!(matches!(err.root(), DispatchError::SecurityViolation(_)));
}

#[tokio::test]
async fn test_requests_tunnel_through_configured_proxy() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/profile")
                .header_missing("proxy-authorization");
            then.status(200).body("steve");
        })
        .await;
    let upstream = *server.address();
    let (proxy, seen) = fake_proxy("HTTP/1.1 200 Connection Established\r\n\r\n", upstream).await;

    let network = network();
    network.apply_settings(NetworkSettings {
        http_proxy: Some(SecretString::from(format!("http://user:pass@{proxy}"))),
        ..NetworkSettings::default()
    });

    let resp = network
        .api_dispatcher()
        .request(DispatchOptions::get(&server.url("/v1/profile")).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.text(), "steve");
    mock.assert_async().await;

    let head = seen.lock().to_ascii_lowercase();
    assert!(head.starts_with(&format!("connect {upstream} http/1.1")));
    assert!(head.contains("proxy-authorization: basic dxnlcjpwyxnz"));
}

#[tokio::test]
async fn test_refused_tunnel_reports_proxy_status() {
    let (proxy, _) = fake_proxy(
        "HTTP/1.1 407 Proxy Authentication Required\r\ncontent-length: 0\r\n\r\n",
        "127.0.0.1:9".parse().unwrap(),
    )
    .await;

    let network = network();
    network.apply_settings(NetworkSettings {
        http_proxy: Some(SecretString::from(format!("http://{proxy}"))),
        ..NetworkSettings::default()
    });

    let err = network
        .api_dispatcher()
        .request(DispatchOptions::get("http://launcher.internal/v1/profile").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err.root(),
        DispatchError::TunnelNotEstablished { status } if *status == StatusCode::PROXY_AUTHENTICATION_REQUIRED
    ));
}
