use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bon::Builder;
use tokio::{
    io::copy_bidirectional,
    net::TcpStream,
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    listener::{
        Listener, ListenerAddr, ListenerError, Provenance, RawConnection, TaggedConnection,
    },
    tls::{PeekedStream, TlsHelloInfo, peek_client_hello},
};

const FORWARD_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// Routing rules applied to every Client Hello before the handshake completes.
#[derive(Debug, Clone, Builder)]
pub(crate) struct InspectorPolicy {
    // Server name to raw TCP backend address.
    #[builder(default)]
    forward: HashMap<String, String>,
    #[builder(default)]
    private_mode: bool,
    // Hosts reachable from the tunnel while in private mode.
    #[builder(default)]
    public_hosts: HashSet<String>,
    #[builder(default = Duration::from_secs(5))]
    hello_timeout: Duration,
}

impl InspectorPolicy {
    // Whether there is any rule that requires inspecting connections at all.
    pub(crate) fn is_active(&self) -> bool {
        self.private_mode || !self.forward.is_empty()
    }

    fn decide(&self, provenance: Provenance, hello: &TlsHelloInfo) -> Decision {
        let server_name = hello
            .server_name
            .as_deref()
            .map(|name| name.trim_end_matches('.').to_ascii_lowercase());
        if self.private_mode && provenance == Provenance::Tunnel {
            let whitelisted = server_name
                .as_ref()
                .is_some_and(|name| self.public_hosts.contains(name));
            if !whitelisted && !hello.is_acme_challenge() {
                return Decision::Reject;
            }
        }
        if let Some(address) = server_name
            .as_ref()
            .and_then(|name| self.forward.get(name))
        {
            return Decision::Forward(address.clone());
        }
        Decision::Pass
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Decision {
    Pass,
    Forward(String),
    Reject,
}

// Listener that inspects the Client Hello of each connection from the inner listener.
//
// Connections that are rejected, malformed, or forwarded as raw TCP are consumed here.
// Every other connection is returned from `accept` with its Client Hello replayed.
pub(crate) struct HelloInspector<L> {
    inner: Arc<L>,
    connections: Mutex<mpsc::Receiver<TaggedConnection>>,
    errors: Mutex<mpsc::Receiver<ListenerError>>,
    closing: CancellationToken,
    close_once: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<L> HelloInspector<L>
where
    L: Listener<Conn = TaggedConnection>,
{
    pub(crate) fn new(inner: L, policy: InspectorPolicy) -> Self {
        let inner = Arc::new(inner);
        let (connections_tx, connections_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let closing = CancellationToken::new();
        let pump = tokio::spawn(pump(
            Arc::clone(&inner),
            Arc::new(policy),
            connections_tx,
            errors_tx,
            closing.clone(),
        ));
        HelloInspector {
            inner,
            connections: Mutex::new(connections_rx),
            errors: Mutex::new(errors_rx),
            closing,
            close_once: AtomicBool::new(false),
            pump: Mutex::new(Some(pump)),
        }
    }
}

async fn pump<L: Listener<Conn = TaggedConnection>>(
    inner: Arc<L>,
    policy: Arc<InspectorPolicy>,
    connections: mpsc::Sender<TaggedConnection>,
    errors: mpsc::Sender<ListenerError>,
    closing: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = closing.cancelled() => break,
            result = inner.accept() => result,
        };
        match result {
            // Inspect each connection separately, so one slow client can't hold up the others.
            Ok(connection) => {
                tokio::spawn(inspect(
                    connection,
                    Arc::clone(&policy),
                    connections.clone(),
                    closing.clone(),
                ));
            }
            Err(ListenerError::Closed) => break,
            Err(error) => {
                tokio::select! {
                    _ = closing.cancelled() => break,
                    sent = errors.send(error) => if sent.is_err() { break },
                }
            }
        }
    }
}

async fn inspect(
    connection: TaggedConnection,
    policy: Arc<InspectorPolicy>,
    connections: mpsc::Sender<TaggedConnection>,
    closing: CancellationToken,
) {
    let peer = connection.peer;
    let provenance = connection.provenance();
    let TaggedConnection { stream, .. } = connection;
    let (hello, stream) = tokio::select! {
        _ = closing.cancelled() => return,
        result = timeout(policy.hello_timeout, peek_client_hello(stream)) => match result {
            Ok(Ok(peeked)) => peeked,
            Ok(Err(error)) => {
                debug!(%peer, %provenance, %error, "Dropping non-TLS connection.");
                return;
            }
            Err(_) => {
                debug!(%peer, %provenance, "Timed out waiting for Client Hello.");
                return;
            }
        },
    };
    match policy.decide(provenance, &hello) {
        Decision::Reject => {
            debug!(
                %peer,
                server_name = ?hello.server_name,
                "Rejecting tunnel connection in private mode."
            );
        }
        Decision::Forward(address) => {
            forward(stream, peer, &address, closing).await;
        }
        Decision::Pass => {
            let connection = TaggedConnection::new(
                RawConnection {
                    stream: Box::pin(stream),
                    peer,
                },
                provenance,
            );
            tokio::select! {
                _ = closing.cancelled() => (),
                _ = connections.send(connection) => (),
            }
        }
    }
}

// Connect to a forward target, giving up on timeout or once the inspector closes.
async fn connect_backend(
    peer: SocketAddr,
    address: &str,
    closing: &CancellationToken,
) -> Option<TcpStream> {
    tokio::select! {
        biased;
        _ = closing.cancelled() => None,
        result = timeout(FORWARD_CONNECT_TIMEOUT, TcpStream::connect(address)) => match result {
            Ok(Ok(backend)) => Some(backend),
            Ok(Err(error)) => {
                warn!(%peer, %address, %error, "Unable to connect to forward target.");
                None
            }
            Err(_) => {
                warn!(%peer, %address, "Timed out connecting to forward target.");
                None
            }
        },
    }
}

// Splice the connection to the backend until either side closes or the inspector closes.
async fn forward(
    mut stream: PeekedStream,
    peer: SocketAddr,
    address: &str,
    closing: CancellationToken,
) {
    let Some(mut backend) = connect_backend(peer, address, &closing).await else {
        return;
    };
    info!(%peer, %address, "Forwarding TLS connection.");
    tokio::select! {
        _ = closing.cancelled() => (),
        result = copy_bidirectional(&mut stream, &mut backend) => {
            if let Err(error) = result {
                debug!(%peer, %address, %error, "Forwarded connection ended with error.");
            }
        }
    }
}

impl<L> Listener for HelloInspector<L>
where
    L: Listener<Conn = TaggedConnection>,
{
    type Conn = TaggedConnection;

    async fn accept(&self) -> Result<TaggedConnection, ListenerError> {
        let mut connections = self.connections.lock().await;
        let mut errors = self.errors.lock().await;
        tokio::select! {
            _ = self.closing.cancelled() => Err(ListenerError::Closed),
            Some(connection) = connections.recv() => Ok(connection),
            Some(error) = errors.recv() => Err(error),
            else => Err(ListenerError::Closed),
        }
    }

    // Stop in-flight forwards and close the inner listener.
    async fn close(&self) -> Result<(), ListenerError> {
        if self.close_once.swap(true, Ordering::AcqRel) {
            return Err(ListenerError::AlreadyClosed);
        }
        self.closing.cancel();
        let result = self.inner.close().await;
        if let Some(pump) = self.pump.lock().await.take() {
            let _ = pump.await;
        }
        result
    }

    fn local_addr(&self) -> ListenerAddr {
        self.inner.local_addr()
    }
}
