use std::{
    fmt::Debug,
    net::IpAddr,
    path::Path,
    sync::{Arc, RwLock},
};

use color_eyre::eyre::{Context, eyre};
use rustls::{
    ServerConfig,
    client::verify_server_name,
    crypto::aws_lc_rs::sign::any_supported_type,
    pki_types::{CertificateDer, DnsName, PrivateKeyDer, ServerName, pem::PemObject},
    server::{ClientHello, ParsedCertificate, ResolvesServerCert},
    sign::CertifiedKey,
};
use tracing::{debug, info};
use trie_rs::map::{Trie, TrieBuilder};
use webpki::EndEntityCert;

use crate::{droppable_handle::DroppableHandle, routes::RouteTable};

// Prefix of the files where rustls-acme stores account keys.
const ACME_ACCOUNT_PREFIX: &str = "cached_account_";

// Source of certificates obtained through TLS-ALPN-01 challenges.
pub(crate) trait AlpnChallengeResolver: Debug + Send + Sync {
    // Replace the set of domains to obtain certificates for.
    fn update_domains(&mut self, domains: Vec<String>);
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>>;
    // Configuration that answers an ongoing TLS-ALPN-01 challenge.
    fn challenge_rustls_config(&self) -> Option<Arc<ServerConfig>>;
}

#[derive(Debug)]
pub(crate) struct DummyAlpnChallengeResolver;

impl AlpnChallengeResolver for DummyAlpnChallengeResolver {
    fn update_domains(&mut self, _: Vec<String>) {}

    fn resolve(&self, _: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        None
    }

    fn challenge_rustls_config(&self) -> Option<Arc<ServerConfig>> {
        None
    }
}

fn reversed_labels(name: &str) -> Vec<String> {
    name.split('.').rev().map(String::from).collect()
}

// Certificates loaded from disk, indexed by their DNS names with labels reversed.
pub(crate) struct ManualCertificates {
    certs: Trie<String, Arc<CertifiedKey>>,
    names: Vec<String>,
}

impl Debug for ManualCertificates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualCertificates")
            .field("names", &self.names)
            .finish_non_exhaustive()
    }
}

impl ManualCertificates {
    pub(crate) fn empty() -> Self {
        ManualCertificates {
            certs: TrieBuilder::new().build(),
            names: Vec::new(),
        }
    }

    // Load every sub-directory containing `fullchain.pem` and `privkey.pem`.
    // Any unreadable or invalid certificate is an error.
    pub(crate) async fn load(directory: &Path) -> color_eyre::Result<Self> {
        let mut builder = TrieBuilder::new();
        let mut names = Vec::new();
        let mut read_dir = tokio::fs::read_dir(directory)
            .await
            .with_context(|| format!("Error reading certificates directory {}", directory.display()))?;
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            let key = tokio::task::spawn_blocking({
                let path = path.clone();
                move || load_certified_key(&path)
            })
            .await?
            .with_context(|| format!("Invalid certificate in {}", path.display()))?;
            let key = Arc::new(key);
            let end_entity = key
                .end_entity_cert()
                .map_err(|error| eyre!("Missing leaf certificate: {error}"))?;
            let eec = EndEntityCert::try_from(end_entity)
                .map_err(|error| eyre!("Invalid leaf certificate in {}: {error}", path.display()))?;
            for name in eec.valid_dns_names() {
                debug!(%name, path = %path.display(), "Loaded manual certificate.");
                // Wildcards are stored under their parent domain and checked on lookup.
                let base = name.strip_prefix("*.").unwrap_or(name);
                builder.push(reversed_labels(base), Arc::clone(&key));
                names.push(name.to_string());
            }
        }
        if !names.is_empty() {
            info!(?names, "Loaded manual certificates.");
        }
        Ok(ManualCertificates {
            certs: builder.build(),
            names,
        })
    }

    // Find a certificate valid for the server name, including wildcards.
    pub(crate) fn get(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let dns_name = DnsName::try_from(server_name).ok()?.to_owned();
        let server_name = ServerName::DnsName(dns_name);
        let query = reversed_labels(&server_name.to_str());
        self.certs
            .common_prefix_search(&query)
            .find(|(_, key): &(Vec<String>, &Arc<CertifiedKey>)| {
                key.end_entity_cert().is_ok_and(|eec| {
                    ParsedCertificate::try_from(eec)
                        .is_ok_and(|cert| verify_server_name(&cert, &server_name).is_ok())
                })
            })
            .map(|(_, key)| Arc::clone(key))
    }

    pub(crate) fn covers(&self, server_name: &str) -> bool {
        self.get(server_name).is_some()
    }
}

fn load_certified_key(path: &Path) -> color_eyre::Result<CertifiedKey> {
    let chain = CertificateDer::pem_file_iter(path.join("fullchain.pem"))?
        .collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(eyre!("fullchain.pem has no certificates"));
    }
    let key = PrivateKeyDer::from_pem_file(path.join("privkey.pem"))?;
    let key = any_supported_type(&key)?;
    let certified = CertifiedKey::new(chain, key);
    certified.keys_match()?;
    Ok(certified)
}

// Hosts that ACME should obtain certificates for: routed DNS names without a manual certificate.
pub(crate) fn acme_domains(hosts: &[String], manual: &ManualCertificates) -> Vec<String> {
    hosts
        .iter()
        .filter(|host| host.parse::<IpAddr>().is_err())
        .filter(|host| DnsName::try_from(host.as_str()).is_ok())
        .filter(|host| !manual.covers(host))
        .cloned()
        .collect()
}

// Resolves certificates from manual certificates first, then from ACME for routed hosts only.
#[derive(Debug)]
pub(crate) struct CertificateResolver {
    manual: Arc<ManualCertificates>,
    alpn_resolver: Arc<RwLock<Box<dyn AlpnChallengeResolver>>>,
    routes: Arc<RouteTable>,
    // Keeps the ACME domains in sync with the routing table.
    _join_handle: DroppableHandle<()>,
}

impl CertificateResolver {
    pub(crate) fn new(
        manual: ManualCertificates,
        alpn_resolver: Box<dyn AlpnChallengeResolver>,
        routes: Arc<RouteTable>,
    ) -> Self {
        let manual = Arc::new(manual);
        let alpn_resolver = Arc::new(RwLock::new(alpn_resolver));
        let join_handle = {
            let manual = Arc::clone(&manual);
            let alpn_resolver = Arc::clone(&alpn_resolver);
            let routes = Arc::clone(&routes);
            let mut rx = routes.subscribe();
            rx.mark_changed();
            DroppableHandle::spawn(async move {
                while rx.changed().await.is_ok() {
                    let domains = acme_domains(&routes.hosts(), &manual);
                    alpn_resolver
                        .write()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .update_domains(domains);
                }
            })
        };
        CertificateResolver {
            manual,
            alpn_resolver,
            routes,
            _join_handle: join_handle,
        }
    }

    pub(crate) fn challenge_rustls_config(&self) -> Option<Arc<ServerConfig>> {
        self.alpn_resolver
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .challenge_rustls_config()
    }
}

impl ResolvesServerCert for CertificateResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?.to_string();
        if let Some(key) = self.manual.get(&server_name) {
            return Some(key);
        }
        if !self.routes.contains(&server_name) {
            debug!(%server_name, "No certificate for unrouted host.");
            return None;
        }
        self.alpn_resolver
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .resolve(client_hello)
    }
}

// Remove every file from the ACME cache except account keys.
pub(crate) async fn purge_acme_cache(directory: &Path) -> color_eyre::Result<usize> {
    let mut read_dir = match tokio::fs::read_dir(directory).await {
        Ok(read_dir) => read_dir,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(error) => {
            return Err(error).with_context(|| {
                format!("Error reading ACME cache directory {}", directory.display())
            });
        }
    };
    let mut removed = 0;
    while let Some(entry) = read_dir.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with(ACME_ACCOUNT_PREFIX)
        {
            continue;
        }
        tokio::fs::remove_file(entry.path())
            .await
            .with_context(|| format!("Error removing {}", entry.path().display()))?;
        removed += 1;
    }
    if removed > 0 {
        info!(removed, "Purged stale ACME cache entries.");
    }
    Ok(removed)
}
