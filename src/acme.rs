use std::{path::PathBuf, sync::Arc};

use rustls::{ServerConfig, server::ResolvesServerCert, sign::CertifiedKey};
use rustls_acme::{AcmeConfig, ResolvesServerCertAcme, UseChallenge, caches::DirCache};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::{certificates::AlpnChallengeResolver, droppable_handle::DroppableHandle};

// Orders in flight for one set of domains. Dropping it stops renewals.
#[derive(Debug)]
struct AcmeSession {
    domains: Vec<String>,
    challenge_config: Arc<ServerConfig>,
    certificates: Arc<ResolvesServerCertAcme>,
    _driver: DroppableHandle<()>,
}

// Let's Encrypt certificates over TLS-ALPN-01 for whichever hosts are currently routed.
#[derive(Debug)]
pub(crate) struct AcmeResolver {
    cache_dir: PathBuf,
    contact: String,
    use_staging: bool,
    session: Option<AcmeSession>,
}

impl AcmeResolver {
    pub(crate) fn new(cache_dir: PathBuf, contact: String, use_staging: bool) -> Self {
        AcmeResolver {
            cache_dir,
            contact,
            use_staging,
            session: None,
        }
    }

    fn start_session(&self, domains: Vec<String>) -> AcmeSession {
        info!(?domains, "Managing ACME certificates.");
        let mut state = AcmeConfig::new(domains.clone())
            .contact_push(format!("mailto:{}", self.contact))
            .cache(DirCache::new(self.cache_dir.clone()))
            .directory_lets_encrypt(!self.use_staging)
            .challenge_type(UseChallenge::TlsAlpn01)
            .state();
        let challenge_config = state.challenge_rustls_config();
        let certificates = state.resolver();
        let driver = DroppableHandle::spawn(async move {
            while let Some(event) = state.next().await {
                if let Err(error) = event {
                    warn!(?error, "ACME order failed.");
                } else {
                    debug!("ACME order progressed.");
                }
            }
        });
        AcmeSession {
            domains,
            challenge_config,
            certificates,
            _driver: driver,
        }
    }
}

impl AlpnChallengeResolver for AcmeResolver {
    fn update_domains(&mut self, mut domains: Vec<String>) {
        domains.sort();
        domains.dedup();
        let unchanged = match &self.session {
            Some(session) => session.domains == domains,
            None => domains.is_empty(),
        };
        if unchanged {
            return;
        }
        // Replace before starting so the previous driver is aborted first.
        self.session = None;
        if domains.is_empty() {
            debug!("No domains left for ACME.");
        } else {
            self.session = Some(self.start_session(domains));
        }
    }

    fn resolve(&self, client_hello: rustls::server::ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.session
            .as_ref()
            .and_then(|session| session.certificates.resolve(client_hello))
    }

    fn challenge_rustls_config(&self) -> Option<Arc<ServerConfig>> {
        self.session
            .as_ref()
            .map(|session| Arc::clone(&session.challenge_config))
    }
}
