//! Stream wrappers used as pipeline stages.
//!
//! # Responsibilities
//! - `IdleTimeoutIo`: fail a stream that sees no read or write progress for a period
//! - `TraceIo`: log every chunk of bytes crossing the stream
//!
//! Both wrap a [`BoxedIo`] so stages compose in any order.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

use crate::net::connection::ConnectionId;

/// Target used by the wire trace stage.
pub const TRACE_LOG_TARGET: &str = "http_ws_transport::tracelog";

const TRACE_PREVIEW_BYTES: usize = 256;

/// Any bidirectional byte stream a pipeline stage can wrap.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedIo = Box<dyn Io>;

/// Idle-timeout watchdog.
///
/// Progress in either direction pushes the deadline forward. When the deadline
/// passes while the caller waits on the stream, the pending operation fails
/// with [`io::ErrorKind::TimedOut`].
pub struct IdleTimeoutIo<S> {
    inner: S,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl<S> IdleTimeoutIo<S> {
    /// Must be called from within a tokio runtime.
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    fn touch(&mut self) {
        let next = Instant::now() + self.timeout;
        self.deadline.as_mut().reset(next);
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        match self.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connection idle for {:?}", self.timeout),
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeoutIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.touch();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => this.poll_expired(cx).map(Err),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeoutIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.touch();
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => this.poll_expired(cx).map(Err),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Wire trace logger.
pub struct TraceIo<S> {
    inner: S,
    connection_id: ConnectionId,
}

impl<S> TraceIo<S> {
    pub fn new(inner: S, connection_id: ConnectionId) -> Self {
        Self { inner, connection_id }
    }
}

fn trace_bytes(connection_id: ConnectionId, direction: &'static str, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    let preview = &bytes[..bytes.len().min(TRACE_PREVIEW_BYTES)];
    tracing::debug!(
        target: TRACE_LOG_TARGET,
        connection_id = %connection_id,
        direction,
        bytes = bytes.len(),
        payload = %String::from_utf8_lossy(preview),
    );
}

impl<S: AsyncRead + Unpin> AsyncRead for TraceIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            trace_bytes(this.connection_id, "inbound", &buf.filled()[before..]);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TraceIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            trace_bytes(this.connection_id, "outbound", &buf[..*n]);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        tracing::debug!(target: TRACE_LOG_TARGET, connection_id = %this.connection_id, "shutdown");
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
