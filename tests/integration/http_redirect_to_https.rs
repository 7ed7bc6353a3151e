use std::time::Duration;

use clap::Parser;
use doorway::{ApplicationConfig, entrypoint};
use http_body_util::{BodyExt, Empty};
use hyper::{Request, StatusCode, body::Bytes, header::LOCATION};
use hyper_util::rt::TokioIo;
use tokio::{net::TcpStream, time::timeout};

use crate::common::{DoorwayHandle, wait_for_port};

async fn http_get(host: &str, path: &str) -> (StatusCode, Option<String>, Bytes) {
    let tcp_stream = TcpStream::connect("127.0.0.1:18081")
        .await
        .expect("TCP connection failed");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp_stream))
        .await
        .expect("HTTP handshake failed");
    tokio::spawn(async move {
        if let Err(error) = conn.await {
            eprintln!("Connection failed: {error:?}");
        }
    });
    let request = Request::builder()
        .method("GET")
        .uri(path)
        .header("host", host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = timeout(Duration::from_secs(5), sender.send_request(request))
        .await
        .expect("Timeout waiting for response")
        .expect("Error sending HTTP request");
    let status = response.status();
    let location = response
        .headers()
        .get(LOCATION)
        .map(|location| location.to_str().unwrap().to_string());
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, location, body)
}

/// This test ensures that plain HTTP redirects to HTTPS, except for local hosts.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn http_redirect_to_https() {
    // 1. Initialize the gateway with plain HTTP only
    let config = ApplicationConfig::parse_from([
        "doorway",
        "--disable-https",
        "--http-address=127.0.0.1:18081",
        "--disable-health-check",
    ]);
    let _doorway_handle = DoorwayHandle(tokio::spawn(async move { entrypoint(config).await }));
    wait_for_port("127.0.0.1:18081").await;

    // 2. Public hosts are redirected
    let (status, location, _) = http_get("app.example:18081", "/some/path?query=1").await;
    assert_eq!(status, StatusCode::PERMANENT_REDIRECT);
    assert_eq!(
        location.as_deref(),
        Some("https://app.example/some/path?query=1")
    );

    // 3. Local hosts are served directly
    let (status, location, body) = http_get("127.0.0.1:18081", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(location, None);
    assert_eq!(body, "ok");
    let (status, _, body) = http_get("appliance.local", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");
}
