use std::time::Duration;

use rustls::{ClientConfig, RootCertStore};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

pub(crate) const MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(thiserror::Error, Debug)]
pub(crate) enum HealthError {
    #[error("Health check failed {0} times in a row")]
    Unhealthy(u32),
    #[error("Unable to create health check client: {0}")]
    Client(#[from] reqwest::Error),
}

// Periodically probes a URL, failing once the probe fails too many times in a row.
#[derive(Debug)]
pub(crate) struct HealthChecker {
    client: reqwest::Client,
    url: String,
    interval: Duration,
}

impl HealthChecker {
    // Each probe times out after one interval.
    pub(crate) fn new(url: String, interval: Duration) -> Result<Self, HealthError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(interval)
            .build()?;
        Ok(HealthChecker {
            client,
            url,
            interval,
        })
    }

    async fn probe(&self) -> Result<(), reqwest::Error> {
        self.client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    // Only returns once the check has failed `MAX_CONSECUTIVE_FAILURES` times in a row.
    pub(crate) async fn run(self) -> HealthError {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0;
        loop {
            ticker.tick().await;
            match self.probe().await {
                Ok(()) => {
                    if failures > 0 {
                        debug!(url = %self.url, "Health check recovered.");
                    }
                    failures = 0;
                }
                Err(error) => {
                    failures += 1;
                    warn!(url = %self.url, %error, failures, "Health check failed.");
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        return HealthError::Unhealthy(failures);
                    }
                }
            }
        }
    }
}
