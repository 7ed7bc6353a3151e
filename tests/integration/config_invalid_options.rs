use clap::Parser;
use doorway::{ApplicationConfig, entrypoint};

/// This test ensures that invalid combinations of options are rejected before anything starts.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn config_invalid_options() {
    let invalid_configs = [
        vec!["doorway", "--disable-http", "--disable-https"],
        vec!["doorway", "--disable-http", "--disable-local-listener"],
        vec!["doorway", "--https-address=not-an-address", "--disable-http"],
        vec![
            "doorway",
            "--https-address=127.0.0.1:18446",
            "--disable-http",
            "--forward=missing-address",
        ],
        vec![
            "doorway",
            "--https-address=127.0.0.1:18446",
            "--disable-http",
            "--route=bad.example=!",
        ],
    ];
    for args in invalid_configs {
        let config = ApplicationConfig::parse_from(args.iter());
        assert!(
            entrypoint(config).await.is_err(),
            "should reject {args:?}"
        );
    }
}
