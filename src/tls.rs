use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, BytesMut};
use rustls::server::{Acceptor, ClientHello};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::listener::BoxedStream;

// Largest Client Hello we're willing to buffer before giving up.
const MAX_CLIENT_HELLO_SIZE: usize = 64 * 1024;

// Data peeked from a TLS Client Hello.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TlsHelloInfo {
    pub(crate) server_name: Option<String>,
    pub(crate) protocols: Vec<Vec<u8>>,
}

impl TlsHelloInfo {
    // Whether this Client Hello belongs to an ACME TLS-ALPN-01 challenge:
    // a server name is present and the only advertised protocol is `acme-tls/1`.
    pub(crate) fn is_acme_challenge(&self) -> bool {
        self.server_name.is_some()
            && self.protocols.len() == 1
            && self.protocols[0] == rustls_acme::acme::ACME_TLS_ALPN_NAME
    }
}

impl From<&ClientHello<'_>> for TlsHelloInfo {
    fn from(client_hello: &ClientHello<'_>) -> Self {
        TlsHelloInfo {
            server_name: client_hello.server_name().map(String::from),
            protocols: client_hello
                .alpn()
                .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
                .unwrap_or_default(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum HelloError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Connection closed before Client Hello")]
    UnexpectedEof,
    #[error("Client Hello is too large")]
    TooLarge,
    #[error("Invalid Client Hello: {0}")]
    Invalid(#[from] rustls::Error),
}

// Read a Client Hello from the stream without answering it.
//
// Every byte read is kept, so that the returned stream replays the Client Hello
// to whoever reads from it next (a TLS acceptor or a raw TCP backend).
pub(crate) async fn peek_client_hello(
    mut stream: BoxedStream,
) -> Result<(TlsHelloInfo, PeekedStream), HelloError> {
    let mut acceptor = Acceptor::default();
    let mut buffer = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HelloError::UnexpectedEof);
        }
        if buffer.len() + n > MAX_CLIENT_HELLO_SIZE {
            return Err(HelloError::TooLarge);
        }
        buffer.extend_from_slice(&chunk[..n]);
        let mut data = &chunk[..n];
        while !data.is_empty() {
            acceptor.read_tls(&mut data)?;
        }
        match acceptor.accept() {
            Ok(Some(accepted)) => {
                let info = TlsHelloInfo::from(&accepted.client_hello());
                return Ok((
                    info,
                    PeekedStream {
                        prefix: buffer,
                        inner: stream,
                    },
                ));
            }
            Ok(None) => continue,
            Err((error, _)) => return Err(error.into()),
        }
    }
}

// Stream that first yields the bytes consumed while peeking, then reads from the inner stream.
pub(crate) struct PeekedStream {
    prefix: BytesMut,
    inner: BoxedStream,
}

impl AsyncRead for PeekedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        self.inner.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for PeekedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.inner.as_mut().poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
