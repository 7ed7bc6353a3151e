use super::{Listener, ListenerAddr, ListenerError, Provenance, RawConnection, TaggedConnection};

// Stamps every connection accepted from the inner listener with a fixed provenance.
#[derive(Debug)]
pub(crate) struct TaggedListener<L> {
    inner: L,
    provenance: Provenance,
}

impl<L> TaggedListener<L>
where
    L: Listener<Conn = RawConnection>,
{
    pub(crate) fn new(inner: L, provenance: Provenance) -> Self {
        TaggedListener { inner, provenance }
    }
}

impl<L> Listener for TaggedListener<L>
where
    L: Listener<Conn = RawConnection>,
{
    type Conn = TaggedConnection;

    async fn accept(&self) -> Result<TaggedConnection, ListenerError> {
        let connection = self.inner.accept().await?;
        Ok(TaggedConnection::new(connection, self.provenance))
    }

    async fn close(&self) -> Result<(), ListenerError> {
        self.inner.close().await
    }

    fn local_addr(&self) -> ListenerAddr {
        self.inner.local_addr()
    }
}
