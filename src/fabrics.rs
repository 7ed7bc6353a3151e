use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bon::Builder;
use hickory_resolver::{
    Resolver, config::ResolverConfig, name_server::TokioConnectionProvider,
};
use russh::{
    Channel, Disconnect,
    client::{self, Handle, Msg, Session},
    keys::{HashAlg, PrivateKey, PublicKey, key::PrivateKeyWithHashAlg},
};
use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::listener::{
    ListenerAddr, ListenerError, RawConnection,
    reconnecting::{RelayDialer, RelaySession},
};

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub(crate) enum FabricsError {
    #[error("No relay endpoint found for {0}")]
    NoEndpoint(String),
    #[error("Unable to resolve relay host {host}: {source}")]
    Resolve {
        host: String,
        source: hickory_resolver::ResolveError,
    },
    #[error("Unable to reach relay at any of {0:?}")]
    Unreachable(Vec<SocketAddr>),
    #[error("Relay host key {0} doesn't match the pinned fingerprint")]
    HostKeyMismatch(String),
    #[error("Relay rejected authentication for user {0}")]
    AuthenticationRejected(String),
    #[error(transparent)]
    Ssh(#[from] russh::Error),
}

impl From<FabricsError> for ListenerError {
    fn from(error: FabricsError) -> Self {
        ListenerError::Relay(error.to_string())
    }
}

// Whether a relay host key matches a pinned `SHA256:...` fingerprint. The prefix is optional.
pub(crate) fn fingerprint_matches(expected: &str, key: &PublicKey) -> bool {
    let actual = key.fingerprint(HashAlg::Sha256).to_string();
    let expected = expected.trim();
    actual == expected
        || actual
            .strip_prefix("SHA256:")
            .is_some_and(|actual| actual == expected)
}

// Dials the fabrics relay over SSH and asks it to forward inbound connections back to us.
#[derive(Builder)]
pub(crate) struct FabricsDialer {
    host: String,
    #[builder(default = 22)]
    port: u16,
    // Static endpoints used instead of DNS.
    #[builder(default)]
    addresses: Vec<IpAddr>,
    user: String,
    key: Arc<PrivateKey>,
    #[builder(default = "0.0.0.0".to_string())]
    bind_host: String,
    #[builder(default = 443)]
    bind_port: u32,
    host_key_fingerprint: Option<String>,
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    connect_timeout: Duration,
}

impl FabricsDialer {
    // Relay endpoints in the order they should be attempted.
    //
    // Local DNS is never consulted: the static list wins, and otherwise a public resolver is queried.
    pub(crate) async fn endpoints(&self) -> Result<Vec<SocketAddr>, FabricsError> {
        if !self.addresses.is_empty() {
            return Ok(self
                .addresses
                .iter()
                .map(|ip| SocketAddr::new(*ip, self.port))
                .collect());
        }
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, self.port)]);
        }
        let resolver = Resolver::builder_with_config(
            ResolverConfig::cloudflare(),
            TokioConnectionProvider::default(),
        )
        .build();
        let lookup = resolver
            .lookup_ip(format!("{}.", self.host))
            .await
            .map_err(|source| FabricsError::Resolve {
                host: self.host.clone(),
                source,
            })?;
        let endpoints: Vec<_> = lookup
            .iter()
            .map(|ip| SocketAddr::new(ip, self.port))
            .collect();
        if endpoints.is_empty() {
            return Err(FabricsError::NoEndpoint(self.host.clone()));
        }
        Ok(endpoints)
    }

    async fn connect(&self) -> Result<(TcpStream, SocketAddr), FabricsError> {
        let endpoints = self.endpoints().await?;
        for endpoint in endpoints.iter() {
            match timeout(self.connect_timeout, TcpStream::connect(endpoint)).await {
                Ok(Ok(stream)) => return Ok((stream, *endpoint)),
                Ok(Err(error)) => debug!(%endpoint, %error, "Unable to connect to relay."),
                Err(_) => debug!(%endpoint, "Timed out connecting to relay."),
            }
        }
        Err(FabricsError::Unreachable(endpoints))
    }

    async fn establish(&self) -> Result<FabricsSession, FabricsError> {
        let (stream, endpoint) = self.connect().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = FabricsHandler {
            host_key_fingerprint: self.host_key_fingerprint.clone(),
            connections: tx,
        };
        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 4,
            ..Default::default()
        });
        let mut handle = client::connect_stream(config, stream, handler).await?;
        let authentication = handle
            .authenticate_publickey(
                &self.user,
                PrivateKeyWithHashAlg::new(
                    Arc::clone(&self.key),
                    handle.best_supported_rsa_hash().await?.flatten(),
                ),
            )
            .await?;
        if !authentication.success() {
            return Err(FabricsError::AuthenticationRejected(self.user.clone()));
        }
        let port = match handle
            .tcpip_forward(self.bind_host.clone(), self.bind_port)
            .await?
        {
            // The relay only reports the port when we let it pick one.
            0 => self.bind_port,
            port => port,
        };
        info!(%endpoint, bind_host = %self.bind_host, port, "Relay forwarding established.");
        Ok(FabricsSession {
            handle,
            connections: Mutex::new(rx),
            address: ListenerAddr::Remote {
                host: self.bind_host.clone(),
                port,
            },
        })
    }
}

impl RelayDialer for FabricsDialer {
    type Session = FabricsSession;

    async fn dial(&self) -> Result<FabricsSession, ListenerError> {
        Ok(self.establish().await?)
    }
}

struct FabricsHandler {
    host_key_fingerprint: Option<String>,
    connections: mpsc::UnboundedSender<RawConnection>,
}

impl client::Handler for FabricsHandler {
    type Error = FabricsError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match self.host_key_fingerprint.as_deref() {
            Some(expected) if !fingerprint_matches(expected, server_public_key) => {
                Err(FabricsError::HostKeyMismatch(
                    server_public_key.fingerprint(HashAlg::Sha256).to_string(),
                ))
            }
            _ => Ok(true),
        }
    }

    // Every forwarded channel is a client of the gateway; the originator is its real address.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        _connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let ip = originator_address.parse().unwrap_or_else(|_| {
            warn!(%originator_address, "Relay sent an invalid originator address.");
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });
        let peer = SocketAddr::new(ip, u16::try_from(originator_port).unwrap_or_default());
        let connection = RawConnection {
            stream: Box::pin(channel.into_stream()),
            peer,
        };
        if self.connections.send(connection).is_err() {
            debug!(%peer, "Relay session closed before the connection was accepted.");
        }
        Ok(())
    }
}

// An authenticated relay session with an active remote forwarding.
pub(crate) struct FabricsSession {
    handle: Handle<FabricsHandler>,
    connections: Mutex<mpsc::UnboundedReceiver<RawConnection>>,
    address: ListenerAddr,
}

impl RelaySession for FabricsSession {
    async fn accept(&self) -> Result<RawConnection, ListenerError> {
        // The handler, and with it the sender, is dropped once the SSH session ends.
        self.connections
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| ListenerError::Relay("relay session ended".into()))
    }

    async fn close(&self) {
        if !self.handle.is_closed() {
            let _ = self
                .handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
        }
        self.connections.lock().await.close();
    }

    fn local_addr(&self) -> ListenerAddr {
        self.address.clone()
    }
}
