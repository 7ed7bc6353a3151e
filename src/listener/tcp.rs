use std::{
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{Listener, ListenerAddr, ListenerError, RawConnection};

// Direct TCP source. Unlike a bare `TcpListener`, a pending accept can be interrupted by `close`.
#[derive(Debug)]
pub(crate) struct TcpSource {
    listener: TcpListener,
    address: SocketAddr,
    closed: CancellationToken,
    close_once: AtomicBool,
}

impl TcpSource {
    pub(crate) async fn bind<A: ToSocketAddrs>(address: A) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let address = listener.local_addr()?;
        Ok(TcpSource {
            listener,
            address,
            closed: CancellationToken::new(),
            close_once: AtomicBool::new(false),
        })
    }
}

impl Listener for TcpSource {
    type Conn = RawConnection;

    async fn accept(&self) -> Result<RawConnection, ListenerError> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(ListenerError::Closed),
            result = self.listener.accept() => {
                let (stream, peer) = result?;
                if let Err(error) = stream.set_nodelay(true) {
                    warn!(%error, address = %peer, "Error setting nodelay.");
                }
                Ok(RawConnection {
                    stream: Box::pin(stream),
                    peer,
                })
            }
        }
    }

    async fn close(&self) -> Result<(), ListenerError> {
        if self.close_once.swap(true, Ordering::AcqRel) {
            return Err(ListenerError::AlreadyClosed);
        }
        self.closed.cancel();
        Ok(())
    }

    fn local_addr(&self) -> ListenerAddr {
        ListenerAddr::Socket(self.address)
    }
}
