use std::net::SocketAddr;

use clap::Parser;
use doorway::{ApplicationConfig, entrypoint};
use hyper::StatusCode;
use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::TlsAcceptor;

use crate::common::{DoorwayHandle, TestCa, https_get, temp_directory, wait_for_port};

/// This test ensures that TLS connections for a forwarded server name reach their backend
/// untouched, while other server names are still terminated by the gateway.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn https_forward_raw_tcp() {
    // 1. Start a TLS echo backend that terminates its own connections
    let ca = TestCa::new();
    let acceptor = TlsAcceptor::from(ca.server_config(&["raw.example"]));
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_address = backend.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = backend.accept().await.unwrap();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let mut stream = acceptor.accept(stream).await.unwrap();
                let mut buf = [0u8; 5];
                stream.read_exact(&mut buf).await.unwrap();
                stream.write_all(b"echo:").await.unwrap();
                stream.write_all(&buf).await.unwrap();
                stream.shutdown().await.unwrap();
            });
        }
    });

    // 2. Initialize the gateway, in private mode to check that direct connections bypass it
    let certificates_directory = temp_directory("forward-raw-tcp");
    ca.write_certificate(&certificates_directory, "gateway", &["home.example"]);
    let config = ApplicationConfig::parse_from([
        "doorway",
        "--https-address=127.0.0.1:18444",
        "--disable-http",
        "--route=home.example=home",
        &format!("--forward=raw.example={backend_address}"),
        "--private-mode",
        "--certificates-directory",
        certificates_directory.to_str().unwrap(),
        "--disable-health-check",
    ]);
    let _doorway_handle = DoorwayHandle(tokio::spawn(async move { entrypoint(config).await }));
    wait_for_port("127.0.0.1:18444").await;
    let address: SocketAddr = "127.0.0.1:18444".parse().unwrap();
    let connector = ca.connector();

    // 3. The forwarded server name is answered by the backend itself
    let tcp_stream = TcpStream::connect(address).await.unwrap();
    let mut tls_stream = connector
        .connect(ServerName::try_from("raw.example").unwrap(), tcp_stream)
        .await
        .expect("TLS handshake with backend failed");
    tls_stream.write_all(b"hello").await.unwrap();
    let mut response = Vec::new();
    tls_stream.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"echo:hello");

    // 4. Other server names are still served by the gateway
    let (response, body) = https_get(&connector, address, "home.example", "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body, "ok");

    let _ = std::fs::remove_dir_all(&certificates_directory);
}
