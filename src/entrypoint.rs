use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use color_eyre::eyre::Context;
use hyper::{Request, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use rustls::{
    ServerConfig,
    server::{Acceptor, ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tokio::{fs, time::timeout};
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    ApplicationConfig,
    acme::AcmeResolver,
    admin::{HEALTH_PATH, admin_router},
    cert_delay::CertificateDelayer,
    certificates::{
        AlpnChallengeResolver, CertificateResolver, DummyAlpnChallengeResolver,
        ManualCertificates, purge_acme_cache,
    },
    droppable_handle::DroppableHandle,
    error::ServerError,
    fabrics::FabricsDialer,
    health::HealthChecker,
    http::{ProxyData, http_client, proxy_handler},
    inspector::{HelloInspector, InspectorPolicy},
    listener::{
        Listener, ListenerError, Provenance, TaggedConnection,
        multiplex::{TaggedMux, TunnelMuxListener},
        reconnecting::{ErrorCallback, ReconnectingListener},
        tagged::TaggedListener,
        tcp::TcpSource,
    },
    plain_http::{PlainHttpData, supervise_plain_http},
    routes::{
        RouteTable, Routes, RoutesFileWatcher, load_routes_file, normalize_host, parse_route_arg,
    },
    tls::TlsHelloInfo,
};

// Pause after a failed accept, so that persistent errors don't turn into a busy loop.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

// Serves a single certificate that has already been chosen for the connection.
#[derive(Debug)]
struct ChosenCertificate(Arc<CertifiedKey>);

impl ResolvesServerCert for ChosenCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

// State shared by every HTTPS connection.
struct HttpsServer {
    certificates: CertificateDelayer<CertificateResolver>,
    proxy_data: Arc<ProxyData>,
    handshake_timeout: Duration,
}

impl HttpsServer {
    async fn handle_connection(self: Arc<Self>, connection: TaggedConnection) {
        let provenance = connection.provenance();
        let TaggedConnection { stream, peer, .. } = connection;
        let start = match timeout(
            self.handshake_timeout,
            LazyConfigAcceptor::new(Acceptor::default(), stream),
        )
        .await
        {
            Ok(Ok(start)) => start,
            Ok(Err(error)) => {
                debug!(%peer, %provenance, %error, "Invalid TLS handshake.");
                return;
            }
            Err(_) => {
                debug!(%peer, %provenance, "Timed out waiting for Client Hello.");
                return;
            }
        };
        let hello = TlsHelloInfo::from(&start.client_hello());
        if hello.is_acme_challenge() {
            let Some(config) = self.certificates.inner().challenge_rustls_config() else {
                debug!(%peer, "No ongoing ACME challenge.");
                return;
            };
            // The challenge is answered by the handshake itself.
            if let Err(error) = start.into_stream(config).await {
                debug!(%peer, %error, "ACME challenge handshake failed.");
            }
            return;
        }
        let Some(key) = self.certificates.get_certificate(start.client_hello()).await else {
            debug!(%peer, server_name = ?hello.server_name, "No certificate for server name.");
            return;
        };
        let mut server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(ChosenCertificate(key)));
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let stream = match start.into_stream(Arc::new(server_config)).await {
            Ok(stream) => stream,
            Err(error) => {
                debug!(%peer, %error, "TLS handshake failed.");
                return;
            }
        };
        let proxy_data = Arc::clone(&self.proxy_data);
        let service = service_fn(move |request: Request<Incoming>| {
            proxy_handler(request, peer, Arc::clone(&proxy_data))
        });
        if let Err(error) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            debug!(%peer, %error, "HTTPS connection error.");
        }
    }
}

// Accept connections until cancelled, then close the listener.
async fn serve_https<L>(listener: L, server: Arc<HttpsServer>, cancellation_token: CancellationToken)
where
    L: Listener<Conn = TaggedConnection>,
{
    loop {
        let result = tokio::select! {
            _ = cancellation_token.cancelled() => break,
            result = listener.accept() => result,
        };
        match result {
            Ok(connection) => {
                tokio::spawn(Arc::clone(&server).handle_connection(connection));
            }
            Err(ListenerError::Closed) => break,
            Err(error) => {
                warn!(%error, "Error accepting HTTPS connection.");
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
            }
        }
    }
    match listener.close().await {
        Ok(()) | Err(ListenerError::AlreadyClosed) => (),
        Err(error) => warn!(%error, "Error closing HTTPS listener."),
    }
    info!("HTTPS server stopped.");
}

fn parse_listen_address(address: &str) -> Result<SocketAddr, ServerError> {
    address
        .parse()
        .map_err(|_| ServerError::InvalidListenAddress(address.to_string()))
}

fn parse_forwards(forwards: &[String]) -> Result<HashMap<String, String>, ServerError> {
    forwards
        .iter()
        .map(|forward| match forward.split_once('=') {
            Some((host, address)) if !host.trim().is_empty() && !address.trim().is_empty() => {
                Ok((normalize_host(host), address.trim().to_string()))
            }
            _ => Err(ServerError::InvalidForward(forward.clone())),
        })
        .collect()
}

// URL probed by the health checker, if any.
fn health_check_url(config: &ApplicationConfig, http_address: SocketAddr) -> Option<String> {
    if config.disable_health_check {
        return None;
    }
    config.health_check_url.clone().or_else(|| {
        (!config.disable_http)
            .then(|| format!("http://127.0.0.1:{}{HEALTH_PATH}", http_address.port()))
    })
}

pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    // Validate the configuration before starting anything.
    if config.disable_http && config.disable_https {
        return Err(ServerError::NothingToServe.into());
    }
    if !config.disable_https && config.disable_local_listener && config.fabrics_host.is_none() {
        return Err(ServerError::NoConnectionSource.into());
    }
    let https_address = parse_listen_address(&config.https_address)?;
    let http_address = parse_listen_address(&config.http_address)?;
    let forward = parse_forwards(&config.forwards)?;
    let policy = InspectorPolicy::builder()
        .forward(forward)
        .private_mode(config.private_mode)
        .public_hosts(
            config
                .public_hosts
                .iter()
                .map(|host| normalize_host(host))
                .collect::<HashSet<_>>(),
        )
        .hello_timeout(config.client_hello_timeout)
        .build();
    let base_routes: Routes = config
        .routes
        .iter()
        .map(|route| parse_route_arg(route))
        .collect::<Result<_, _>>()
        .with_context(|| "Invalid route")?;
    let mut routes = base_routes.clone();
    if let Some(path) = config.routes_file.as_ref() {
        routes.extend(load_routes_file(path).await?);
    }
    for (host, route) in routes.iter() {
        debug!(%host, %route, "Configured route.");
    }
    let routes = Arc::new(RouteTable::new(routes));
    let _routes_watcher = match config.routes_file.clone() {
        Some(path) => Some(
            RoutesFileWatcher::new(path, base_routes, Arc::clone(&routes))
                .with_context(|| "Error setting up routes file watcher")?,
        ),
        None => None,
    };
    let fabrics_dialer = match config.fabrics_host.clone() {
        Some(host) if !config.disable_https => {
            let key = russh::keys::load_secret_key(&config.fabrics_key_file, None).map_err(
                |source| ServerError::InvalidFabricsKey {
                    path: config.fabrics_key_file.clone(),
                    source,
                },
            )?;
            Some(
                FabricsDialer::builder()
                    .host(host)
                    .port(config.fabrics_port)
                    .addresses(config.fabrics_addresses.clone())
                    .user(config.fabrics_user.clone())
                    .key(Arc::new(key))
                    .bind_host(config.fabrics_bind_host.clone())
                    .bind_port(config.fabrics_bind_port)
                    .maybe_host_key_fingerprint(config.fabrics_host_key_fingerprint.clone())
                    .build(),
            )
        }
        _ => None,
    };
    let manual_certificates = match config.certificates_directory.as_ref() {
        Some(directory) => ManualCertificates::load(directory)
            .await
            .with_context(|| "Error loading certificates")?,
        None => ManualCertificates::empty(),
    };
    let alpn_resolver: Box<dyn AlpnChallengeResolver> = match config.acme_contact_email.clone() {
        Some(contact) => {
            let purged = purge_acme_cache(&config.acme_cache_directory)
                .await
                .with_context(|| "Error purging ACME cache")?;
            debug!(purged, "Purged ACME cache.");
            fs::create_dir_all(&config.acme_cache_directory)
                .await
                .with_context(|| "Error creating ACME cache directory")?;
            Box::new(AcmeResolver::new(
                config.acme_cache_directory.clone(),
                contact,
                config.acme_use_staging,
            ))
        }
        None => Box::new(DummyAlpnChallengeResolver),
    };

    let cancellation_token = CancellationToken::new();
    let client = http_client();

    // Plain HTTP runs independently of HTTPS.
    let plain_http_task = (!config.disable_http).then(|| {
        let data = Arc::new(
            PlainHttpData::builder()
                .maybe_local_proxy_address(config.local_proxy_address.clone())
                .admin(admin_router())
                .client(client.clone())
                .build(),
        );
        DroppableHandle::spawn(supervise_plain_http(
            http_address,
            data,
            cancellation_token.clone(),
        ))
    });

    let https_task = if config.disable_https {
        None
    } else {
        let local = if config.disable_local_listener {
            None
        } else {
            let source = TcpSource::bind(https_address)
                .await
                .with_context(|| "Error listening to HTTPS address")?;
            Some(TaggedListener::new(source, Provenance::DirectTcp))
        };
        let tunnel = match fabrics_dialer {
            Some(dialer) => {
                let on_error: ErrorCallback =
                    Arc::new(|error: &ListenerError| warn!(%error, "Relay tunnel error."));
                let listener = ReconnectingListener::new(dialer, on_error)
                    .await
                    .with_context(|| "Error connecting to relay")?;
                Some(TaggedListener::new(listener, Provenance::Tunnel))
            }
            None => None,
        };
        let listener: TaggedMux<TcpSource, ReconnectingListener> =
            TunnelMuxListener::new(local, tunnel)?;
        info!(address = %listener.local_addr(), "Listening for HTTPS connections.");
        let resolver = CertificateResolver::new(manual_certificates, alpn_resolver, Arc::clone(&routes));
        let server = Arc::new(HttpsServer {
            certificates: CertificateDelayer::new(resolver),
            proxy_data: Arc::new(
                ProxyData::builder()
                    .routes(Arc::clone(&routes))
                    .admin(admin_router())
                    .client(client.clone())
                    .build(),
            ),
            handshake_timeout: config.client_hello_timeout,
        });
        let task = if policy.is_active() {
            DroppableHandle::spawn(serve_https(
                HelloInspector::new(listener, policy),
                server,
                cancellation_token.clone(),
            ))
        } else {
            DroppableHandle::spawn(serve_https(listener, server, cancellation_token.clone()))
        };
        Some(task)
    };

    let health_checker = health_check_url(&config, http_address)
        .map(|url| HealthChecker::new(url, config.health_check_interval))
        .transpose()
        .with_context(|| "Error creating health checker")?;
    let health_check = async move {
        match health_checker {
            Some(checker) => checker.run().await,
            None => std::future::pending().await,
        }
    };

    let result = tokio::select! {
        result = wait_for_signal() => result.with_context(|| "Error listening for signals"),
        error = health_check => Err(color_eyre::Report::new(error).wrap_err("Gateway is unhealthy")),
    };
    info!("Shutting down...");
    cancellation_token.cancel();
    if let Some(task) = https_task {
        let _ = task.await;
    }
    if let Some(task) = plain_http_task {
        let _ = task.await;
    }
    result
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut signal_terminate = signal(SignalKind::terminate())?;
    let mut signal_interrupt = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = signal_terminate.recv() => debug!("Received SIGTERM."),
        _ = signal_interrupt.recv() => debug!("Received SIGINT."),
    };
    Ok(())
}

#[cfg(windows)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::windows;

    let mut signal_c = windows::ctrl_c()?;
    let mut signal_break = windows::ctrl_break()?;
    let mut signal_close = windows::ctrl_close()?;
    let mut signal_shutdown = windows::ctrl_shutdown()?;

    tokio::select! {
        _ = signal_c.recv() => debug!("Received CTRL_C."),
        _ = signal_break.recv() => debug!("Received CTRL_BREAK."),
        _ = signal_close.recv() => debug!("Received CTRL_CLOSE."),
        _ = signal_shutdown.recv() => debug!("Received CTRL_SHUTDOWN."),
    };
    Ok(())
}
