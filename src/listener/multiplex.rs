use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Listener, ListenerAddr, ListenerError, TaggedConnection, tagged::TaggedListener};

// Merges a local listener and a relay listener into a single accept stream.
//
// Connections are delivered first-come-first-served with no bias toward either source.
pub(crate) struct TunnelMuxListener<A, B> {
    local: Option<Arc<A>>,
    tunnel: Option<Arc<B>>,
    connections: Mutex<mpsc::Receiver<TaggedConnection>>,
    errors: Mutex<mpsc::Receiver<ListenerError>>,
    closed: CancellationToken,
    close_once: AtomicBool,
    relays: Mutex<Vec<JoinHandle<()>>>,
}

impl<A, B> TunnelMuxListener<A, B>
where
    A: Listener<Conn = TaggedConnection>,
    B: Listener<Conn = TaggedConnection>,
{
    // At least one of the sources must be present.
    pub(crate) fn new(local: Option<A>, tunnel: Option<B>) -> Result<Self, ListenerError> {
        if local.is_none() && tunnel.is_none() {
            return Err(ListenerError::NoSource);
        }
        let (connections_tx, connections_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let closed = CancellationToken::new();
        let local = local.map(Arc::new);
        let tunnel = tunnel.map(Arc::new);
        let mut relays = Vec::with_capacity(2);
        if let Some(local) = local.as_ref() {
            relays.push(tokio::spawn(relay(
                Arc::clone(local),
                connections_tx.clone(),
                errors_tx.clone(),
                closed.clone(),
            )));
        }
        if let Some(tunnel) = tunnel.as_ref() {
            relays.push(tokio::spawn(relay(
                Arc::clone(tunnel),
                connections_tx,
                errors_tx,
                closed.clone(),
            )));
        }
        Ok(TunnelMuxListener {
            local,
            tunnel,
            connections: Mutex::new(connections_rx),
            errors: Mutex::new(errors_rx),
            closed,
            close_once: AtomicBool::new(false),
            relays: Mutex::new(relays),
        })
    }
}

// Pump results from one source into the shared channels until the source or the mux closes.
async fn relay<L: Listener<Conn = TaggedConnection>>(
    source: Arc<L>,
    connections: mpsc::Sender<TaggedConnection>,
    errors: mpsc::Sender<ListenerError>,
    closed: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = closed.cancelled() => break,
            result = source.accept() => result,
        };
        let sent = match result {
            Ok(connection) => tokio::select! {
                _ = closed.cancelled() => break,
                sent = connections.send(connection) => sent.is_ok(),
            },
            Err(ListenerError::Closed) => break,
            Err(error) => tokio::select! {
                _ = closed.cancelled() => break,
                sent = errors.send(error) => sent.is_ok(),
            },
        };
        if !sent {
            break;
        }
    }
    debug!(address = %source.local_addr(), "Listener relay finished.");
}

impl<A, B> Listener for TunnelMuxListener<A, B>
where
    A: Listener<Conn = TaggedConnection>,
    B: Listener<Conn = TaggedConnection>,
{
    type Conn = TaggedConnection;

    async fn accept(&self) -> Result<TaggedConnection, ListenerError> {
        let mut connections = self.connections.lock().await;
        let mut errors = self.errors.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(ListenerError::Closed),
            Some(connection) = connections.recv() => Ok(connection),
            Some(error) = errors.recv() => Err(error),
            else => Err(ListenerError::Closed),
        }
    }

    // Close both sources and wait for both relays to finish.
    //
    // When both sources fail to close, the local listener's error is returned and the
    // tunnel's error is logged.
    async fn close(&self) -> Result<(), ListenerError> {
        if self.close_once.swap(true, Ordering::AcqRel) {
            return Err(ListenerError::AlreadyClosed);
        }
        self.closed.cancel();
        let local_result = match self.local.as_ref() {
            Some(local) => local.close().await,
            None => Ok(()),
        };
        let tunnel_result = match self.tunnel.as_ref() {
            Some(tunnel) => tunnel.close().await,
            None => Ok(()),
        };
        for relay in self.relays.lock().await.drain(..) {
            let _ = relay.await;
        }
        match (local_result, tunnel_result) {
            (Err(local_error), Err(tunnel_error)) => {
                warn!(error = %tunnel_error, "Tunnel listener also failed to close.");
                Err(local_error)
            }
            (Err(error), Ok(())) | (Ok(()), Err(error)) => Err(error),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    fn local_addr(&self) -> ListenerAddr {
        let mut addresses = Vec::with_capacity(2);
        if let Some(local) = self.local.as_ref() {
            addresses.push((super::Provenance::DirectTcp, local.local_addr()));
        }
        if let Some(tunnel) = self.tunnel.as_ref() {
            addresses.push((super::Provenance::Tunnel, tunnel.local_addr()));
        }
        ListenerAddr::Composite(addresses)
    }
}

// Convenience alias for the mux over two tagged sources.
pub(crate) type TaggedMux<A, B> = TunnelMuxListener<TaggedListener<A>, TaggedListener<B>>;
