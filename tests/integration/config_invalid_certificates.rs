use clap::Parser;
use doorway::{ApplicationConfig, entrypoint};

use crate::common::temp_directory;

/// This test ensures that the gateway refuses to start with an invalid manual certificate.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn config_invalid_certificates() {
    let certificates_directory = temp_directory("invalid-certificates");
    let broken = certificates_directory.join("broken");
    std::fs::create_dir_all(&broken).unwrap();
    std::fs::write(broken.join("fullchain.pem"), "-----BEGIN CERTIFICATE-----\n").unwrap();
    std::fs::write(broken.join("privkey.pem"), "").unwrap();
    let config = ApplicationConfig::parse_from([
        "doorway",
        "--https-address=127.0.0.1:18445",
        "--disable-http",
        "--certificates-directory",
        certificates_directory.to_str().unwrap(),
    ]);
    assert!(
        entrypoint(config).await.is_err(),
        "should fail to start with invalid certificates"
    );
    let _ = std::fs::remove_dir_all(&certificates_directory);
}
