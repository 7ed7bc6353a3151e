use std::{fmt, future::Future, io, net::SocketAddr, pin::Pin};

use tokio::io::{AsyncRead, AsyncWrite};

pub(crate) mod multiplex;
pub(crate) mod reconnecting;
pub(crate) mod tagged;
pub(crate) mod tcp;

// Any bidirectional byte stream that can be moved across tasks.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub(crate) type BoxedStream = Pin<Box<dyn AsyncStream>>;

#[derive(thiserror::Error, Debug)]
pub(crate) enum ListenerError {
    // The listener has been closed. Equivalent to an EOF on accept.
    #[error("Listener closed")]
    Closed,
    #[error("Listener already closed")]
    AlreadyClosed,
    #[error("No connection source configured")]
    NoSource,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Relay error: {0}")]
    Relay(String),
}

// Where a connection entered the gateway from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Provenance {
    DirectTcp,
    Tunnel,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::DirectTcp => f.write_str("direct-tcp"),
            Provenance::Tunnel => f.write_str("tunnel"),
        }
    }
}

// Address that a listener is reachable on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ListenerAddr {
    // Not connected yet.
    Empty,
    Socket(SocketAddr),
    // Endpoint exposed by a remote relay.
    Remote { host: String, port: u32 },
    Composite(Vec<(Provenance, ListenerAddr)>),
}

impl fmt::Display for ListenerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerAddr::Empty => f.write_str("<empty>"),
            ListenerAddr::Socket(address) => address.fmt(f),
            ListenerAddr::Remote { host, port } => write!(f, "{host}:{port}"),
            ListenerAddr::Composite(addresses) => {
                f.write_str("[")?;
                for (i, (provenance, address)) in addresses.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{provenance}={address}")?;
                }
                f.write_str("]")
            }
        }
    }
}

// A connection as produced by a source, before it's tagged with its provenance.
pub(crate) struct RawConnection {
    pub(crate) stream: BoxedStream,
    // Address of the original remote peer. For tunneled connections, this is the
    // address reported by the relay rather than the relay's own address.
    pub(crate) peer: SocketAddr,
}

impl fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConnection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

// A connection stamped with where it came from. The tag never changes after accept.
pub(crate) struct TaggedConnection {
    pub(crate) stream: BoxedStream,
    pub(crate) peer: SocketAddr,
    provenance: Provenance,
}

impl TaggedConnection {
    pub(crate) fn new(connection: RawConnection, provenance: Provenance) -> Self {
        TaggedConnection {
            stream: connection.stream,
            peer: connection.peer,
            provenance,
        }
    }

    pub(crate) fn provenance(&self) -> Provenance {
        self.provenance
    }
}

impl fmt::Debug for TaggedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedConnection")
            .field("peer", &self.peer)
            .field("provenance", &self.provenance)
            .finish_non_exhaustive()
    }
}

// Source of incoming connections.
//
// All methods take `&self` so that `close` may run concurrently with a pending `accept`,
// which must then return `ListenerError::Closed`.
pub(crate) trait Listener: Send + Sync + 'static {
    type Conn: Send + 'static;

    fn accept(&self) -> impl Future<Output = Result<Self::Conn, ListenerError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), ListenerError>> + Send;

    fn local_addr(&self) -> ListenerAddr;
}
