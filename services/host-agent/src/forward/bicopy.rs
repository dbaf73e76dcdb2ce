use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::ForwardStream;

/// Copy `x → y` and `y → x` concurrently.
///
/// Returns once both directions have finished or `quit` fires. On EOF the
/// opposite write side is shut down when the stream supports half-close; a
/// copy error tears the whole session down. Both streams are closed exactly
/// once, when the last of their halves is dropped on return.
pub async fn bicopy<X, Y>(x: X, y: Y, quit: CancellationToken)
where
    X: ForwardStream,
    Y: ForwardStream,
{
    let x_half_close = x.supports_half_close();
    let y_half_close = y.supports_half_close();
    let (x_read, x_write) = tokio::io::split(x);
    let (y_read, y_write) = tokio::io::split(y);

    let session = quit.child_token();
    let (sent, received) = tokio::join!(
        broker("x->y", x_read, y_write, y_half_close, session.clone()),
        broker("y->x", y_read, x_write, x_half_close, session.clone()),
    );
    session.cancel();
    trace!(sent, received, "Session finished");
}

async fn broker<R, W>(
    direction: &'static str,
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    half_close: bool,
    session: CancellationToken,
) -> u64
where
    R: ForwardStream,
    W: ForwardStream,
{
    let copied = tokio::select! {
        _ = session.cancelled() => return 0,
        res = tokio::io::copy(&mut reader, &mut writer) => res,
    };

    match copied {
        Ok(n) => {
            if half_close {
                if let Err(e) = writer.shutdown().await {
                    debug!(direction, error = %e, "Half-close failed");
                }
            } else {
                debug!(direction, "Half-close unsupported, waiting for full close");
            }
            n
        }
        Err(e) => {
            debug!(direction, error = %e, "Copy failed, closing session");
            session.cancel();
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};

    struct Tracked {
        inner: DuplexStream,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AsyncRead for Tracked {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Tracked {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    impl ForwardStream for Tracked {}

    fn pair(drops: &Arc<AtomicUsize>) -> (Tracked, DuplexStream) {
        let (ours, peer) = duplex(1024);
        (
            Tracked {
                inner: ours,
                drops: drops.clone(),
            },
            peer,
        )
    }

    const LIMIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_eof_on_one_side() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (x, mut client) = pair(&drops);
        let (y, mut server) = pair(&drops);

        let session = tokio::spawn(bicopy(x, y, CancellationToken::new()));

        client.write_all(b"hello").await.unwrap();
        client.shutdown().await.unwrap();

        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello");

        server.write_all(b"bye").await.unwrap();
        drop(server);
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"bye");

        tokio::time::timeout(LIMIT, session).await.unwrap().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_quit_before_data() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (x, _client) = pair(&drops);
        let (y, _server) = pair(&drops);

        let quit = CancellationToken::new();
        quit.cancel();
        tokio::time::timeout(LIMIT, bicopy(x, y, quit)).await.unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_both_sides_closed() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (x, client) = pair(&drops);
        let (y, server) = pair(&drops);
        drop(client);
        drop(server);

        tokio::time::timeout(LIMIT, bicopy(x, y, CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_quit_mid_session() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (x, mut client) = pair(&drops);
        let (y, _server) = pair(&drops);

        let quit = CancellationToken::new();
        let session = tokio::spawn(bicopy(x, y, quit.clone()));
        client.write_all(b"partial").await.unwrap();
        quit.cancel();

        tokio::time::timeout(LIMIT, session).await.unwrap().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }
}
