use std::time::Duration;

use axum::Router;
use clap::Parser;
use doorway::{ApplicationConfig, entrypoint};
use tokio::{net::TcpListener, time::sleep};

use crate::common::{DoorwayHandle, wait_for_port};

/// This test ensures that the default health check keeps passing when local hosts are
/// proxied to a backend that doesn't serve the health endpoint.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn health_check_local_proxy() {
    // 1. Start a backend that answers 404 to everything
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, Router::new()).await });

    // 2. Initialize the gateway with a short health check interval
    let config = ApplicationConfig::parse_from([
        "doorway",
        "--disable-https",
        "--http-address=127.0.0.1:18091",
        &format!("--local-proxy-address={backend}"),
        "--health-check-interval=100ms",
    ]);
    let doorway_handle = DoorwayHandle(tokio::spawn(async move { entrypoint(config).await }));
    wait_for_port("127.0.0.1:18091").await;

    // 3. Well past five intervals, the gateway is still running
    sleep(Duration::from_secs(2)).await;
    assert!(
        !doorway_handle.0.is_finished(),
        "gateway should stay healthy"
    );
}
