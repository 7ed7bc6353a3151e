use std::net::SocketAddr;

use axum::Router;
use clap::Parser;
use doorway::{ApplicationConfig, entrypoint};
use hyper::{StatusCode, header::LOCATION};
use tokio::net::TcpListener;

use crate::common::{DoorwayHandle, TestCa, https_get, temp_directory, wait_for_port};

/// This test ensures that HTTPS requests are dispatched according to the route of their host.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn https_virtual_hosts() {
    // 1. Start the backend
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_address = backend.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(backend, Router::new().fallback(|| async { "dest" }))
            .await
            .unwrap();
    });

    // 2. Create certificates for every host
    let ca = TestCa::new();
    let certificates_directory = temp_directory("virtual-hosts");
    ca.write_certificate(
        &certificates_directory,
        "gateway",
        &["a.example", "b.example", "c.example", "z.example"],
    );

    // 3. Initialize the gateway
    let config = ApplicationConfig::parse_from([
        "doorway",
        "--https-address=127.0.0.1:18443",
        "--http-address=127.0.0.1:18080",
        "--route=a.example=home",
        &format!("--route=b.example={backend_address}"),
        "--route=c.example=!d.example",
        "--certificates-directory",
        certificates_directory.to_str().unwrap(),
        "--disable-health-check",
    ]);
    let _doorway_handle = DoorwayHandle(tokio::spawn(async move { entrypoint(config).await }));
    wait_for_port("127.0.0.1:18443").await;
    let address: SocketAddr = "127.0.0.1:18443".parse().unwrap();
    let connector = ca.connector();

    // 4. Proxied host reaches the backend, with HSTS
    let (response, body) = https_get(&connector, address, "b.example", "/x").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body, "dest");
    assert_eq!(
        response
            .headers()
            .get("strict-transport-security")
            .expect("missing HSTS header"),
        "max-age=15552000; includeSubDomains"
    );

    // 5. Home host is answered by the administration interface
    let (response, body) = https_get(&connector, address, "a.example", "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body, "ok");

    // 6. Redirect host points to the other host
    let (response, _) = https_get(&connector, address, "c.example", "/").await;
    assert!(response.status().is_redirection());
    assert_eq!(
        response.headers().get(LOCATION).unwrap(),
        "https://d.example/"
    );

    // 7. Unknown host is not found
    let (response, _) = https_get(&connector, address, "z.example", "/").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let _ = std::fs::remove_dir_all(&certificates_directory);
}
