use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Listener, ListenerAddr, ListenerError, RawConnection};

// How long to wait before dialing the relay again after a failure.
pub(crate) const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

// A live session with a relay, yielding the inbound connections it proxies to us.
pub(crate) trait RelaySession: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = Result<RawConnection, ListenerError>> + Send;

    // Tear down the session, unblocking any pending accept.
    fn close(&self) -> impl Future<Output = ()> + Send;

    fn local_addr(&self) -> ListenerAddr;
}

// Establishes new relay sessions.
pub(crate) trait RelayDialer: Send + Sync + 'static {
    type Session: RelaySession;

    fn dial(&self) -> impl Future<Output = Result<Self::Session, ListenerError>> + Send;
}

// Invoked for every dial or accept error in the background loop.
pub(crate) type ErrorCallback = Arc<dyn Fn(&ListenerError) + Send + Sync>;

// State of the relay connection, owned exclusively by the background task.
enum ReconnectState<S> {
    Dialing,
    Connected(S),
    Closed,
}

// Turns a relay dialer into a listener that transparently re-dials whenever the session drops.
pub(crate) struct ReconnectingListener {
    connections: Mutex<mpsc::Receiver<RawConnection>>,
    address: watch::Receiver<ListenerAddr>,
    closed: CancellationToken,
    close_once: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectingListener {
    // Dial once before returning; a failure here is fatal to the listener.
    pub(crate) async fn new<D: RelayDialer>(
        dialer: D,
        on_error: ErrorCallback,
    ) -> Result<Self, ListenerError> {
        Self::with_backoff(dialer, on_error, RECONNECT_BACKOFF).await
    }

    pub(crate) async fn with_backoff<D: RelayDialer>(
        dialer: D,
        on_error: ErrorCallback,
        backoff: Duration,
    ) -> Result<Self, ListenerError> {
        let (address_tx, address_rx) = watch::channel(ListenerAddr::Empty);
        let session = dialer.dial().await?;
        address_tx.send_replace(session.local_addr());
        info!(address = %session.local_addr(), "Connected to relay.");
        // Capacity of one: at most one connection waits in the buffer for an accepter.
        let (connections_tx, connections_rx) = mpsc::channel(1);
        let closed = CancellationToken::new();
        let reconnect_loop = ReconnectLoop {
            dialer,
            on_error,
            backoff,
            connections: connections_tx,
            address: address_tx,
            closed: closed.clone(),
        };
        let task = tokio::spawn(reconnect_loop.run(ReconnectState::Connected(session)));
        Ok(ReconnectingListener {
            connections: Mutex::new(connections_rx),
            address: address_rx,
            closed,
            close_once: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        })
    }
}

impl Listener for ReconnectingListener {
    type Conn = RawConnection;

    async fn accept(&self) -> Result<RawConnection, ListenerError> {
        let mut connections = self.connections.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(ListenerError::Closed),
            connection = connections.recv() => connection.ok_or(ListenerError::Closed),
        }
    }

    async fn close(&self) -> Result<(), ListenerError> {
        if self.close_once.swap(true, Ordering::AcqRel) {
            return Err(ListenerError::AlreadyClosed);
        }
        self.closed.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        Ok(())
    }

    fn local_addr(&self) -> ListenerAddr {
        self.address.borrow().clone()
    }
}

struct ReconnectLoop<D> {
    dialer: D,
    on_error: ErrorCallback,
    backoff: Duration,
    connections: mpsc::Sender<RawConnection>,
    address: watch::Sender<ListenerAddr>,
    closed: CancellationToken,
}

enum SessionEvent {
    Accepted(RawConnection),
    Failed(ListenerError),
    Cancelled,
}

impl<D: RelayDialer> ReconnectLoop<D> {
    async fn run(self, mut state: ReconnectState<D::Session>) {
        loop {
            state = match state {
                ReconnectState::Dialing => {
                    let result = tokio::select! {
                        _ = self.closed.cancelled() => None,
                        result = self.dialer.dial() => Some(result),
                    };
                    match result {
                        None => ReconnectState::Closed,
                        Some(Ok(session)) => {
                            info!(address = %session.local_addr(), "Reconnected to relay.");
                            self.address.send_replace(session.local_addr());
                            ReconnectState::Connected(session)
                        }
                        Some(Err(error)) => {
                            (self.on_error)(&error);
                            self.wait_backoff().await
                        }
                    }
                }
                ReconnectState::Connected(session) => {
                    let event = tokio::select! {
                        _ = self.closed.cancelled() => SessionEvent::Cancelled,
                        result = session.accept() => match result {
                            Ok(connection) => SessionEvent::Accepted(connection),
                            Err(error) => SessionEvent::Failed(error),
                        },
                    };
                    match event {
                        SessionEvent::Accepted(connection) => {
                            let delivered = tokio::select! {
                                _ = self.closed.cancelled() => false,
                                result = self.connections.send(connection) => result.is_ok(),
                            };
                            if delivered {
                                ReconnectState::Connected(session)
                            } else {
                                session.close().await;
                                ReconnectState::Closed
                            }
                        }
                        SessionEvent::Failed(error) => {
                            (self.on_error)(&error);
                            session.close().await;
                            self.wait_backoff().await
                        }
                        SessionEvent::Cancelled => {
                            session.close().await;
                            ReconnectState::Closed
                        }
                    }
                }
                ReconnectState::Closed => break,
            };
        }
        debug!("Relay reconnection loop finished.");
    }

    // Sleep before the next dial, unless closed in the meantime.
    async fn wait_backoff(&self) -> ReconnectState<D::Session> {
        tokio::select! {
            _ = self.closed.cancelled() => ReconnectState::Closed,
            _ = sleep(self.backoff) => ReconnectState::Dialing,
        }
    }
}
