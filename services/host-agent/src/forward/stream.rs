use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// A connection end that can be handed to [`bicopy`](super::bicopy).
pub trait ForwardStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Whether shutting down the write side leaves the read side usable.
    fn supports_half_close(&self) -> bool {
        true
    }
}

pub type BoxedStream = Box<dyn ForwardStream>;

impl ForwardStream for TcpStream {}

#[cfg(unix)]
impl ForwardStream for UnixStream {}

impl ForwardStream for DuplexStream {}

impl ForwardStream for BoxedStream {
    fn supports_half_close(&self) -> bool {
        (**self).supports_half_close()
    }
}

/// Stream whose peer treats any shutdown as a full close.
///
/// Firecracker's hybrid vsock tears the whole guest connection down when the
/// host side shuts down writing.
pub struct FullCloseOnly<S>(pub S);

impl<S: AsyncRead + Unpin> AsyncRead for FullCloseOnly<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FullCloseOnly<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> ForwardStream for FullCloseOnly<S> {
    fn supports_half_close(&self) -> bool {
        false
    }
}
