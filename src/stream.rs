//! Connection stream types.
//!
//! [`RawStream`] abstracts over the transport under TLS: a plain TCP socket
//! in the common case, or whatever a caller-supplied dial function produced
//! (a proxy tunnel, an in-memory pipe in tests). [`Connection`] is the
//! instrumented, TLS-encrypted stream handed back to callers.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::metrics::{AuthKind, MetricRecorder};

/// Any stream a custom dial function may produce.
pub trait CustomStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> CustomStream for T {}

/// Transport stream under the TLS session.
pub enum RawStream {
    /// Plain TCP connection (the built-in dial path).
    Tcp(TcpStream),
    /// Stream produced by a caller-supplied dial function.
    Custom(Box<dyn CustomStream>),
}

impl AsyncRead for RawStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RawStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            RawStream::Custom(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RawStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RawStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            RawStream::Custom(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RawStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            RawStream::Custom(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RawStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            RawStream::Custom(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// An authenticated, mutually-TLS-encrypted stream to an instance's
/// server-side proxy, ready for the database wire protocol.
///
/// Traffic is counted into the dialer's metrics. Shutting the connection
/// down cleanly decrements the instance's open-connection counter exactly
/// once; the counter is not decremented when the shutdown fails or the
/// connection is merely dropped.
pub struct Connection {
    inner: TlsStream<RawStream>,
    metrics: Arc<dyn MetricRecorder>,
    auth: AuthKind,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("auth", &self.auth).finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        inner: TlsStream<RawStream>,
        metrics: Arc<dyn MetricRecorder>,
        auth: AuthKind,
        on_close: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Connection {
            inner,
            metrics,
            auth,
            on_close: Some(on_close),
        }
    }

    /// The negotiated TLS protocol version.
    pub fn tls_version(&self) -> Option<rustls::ProtocolVersion> {
        self.inner.get_ref().1.protocol_version()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.metrics.record_bytes_rx(n as u64);
            }
        }
        res
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            if n > 0 {
                this.metrics.record_bytes_tx(n as u64);
            }
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(Ok(())) => {
                if let Some(on_close) = this.on_close.take() {
                    this.metrics.record_closed_connection(this.auth);
                    on_close();
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
