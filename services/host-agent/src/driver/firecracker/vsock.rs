//! Firecracker hybrid vsock: host-initiated guest connections over a Unix socket.
//!
//! The host connects to the device's socket, writes `CONNECT <port>\n`, and
//! Firecracker answers `OK <host port>\n` once the guest accepted.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use crate::forward::{BoxedStream, FullCloseOnly, GuestDialer};

const MAX_REPLY: usize = 64;

#[derive(Debug, Clone)]
pub struct HybridVsockDialer {
    uds_path: PathBuf,
}

impl HybridVsockDialer {
    pub fn new(uds_path: impl Into<PathBuf>) -> Self {
        Self {
            uds_path: uds_path.into(),
        }
    }
}

#[async_trait]
impl GuestDialer for HybridVsockDialer {
    async fn dial(&self, port: u32) -> io::Result<BoxedStream> {
        let mut stream = UnixStream::connect(&self.uds_path).await?;
        stream.write_all(format!("CONNECT {port}\n").as_bytes()).await?;

        // Read byte by byte: anything after the newline belongs to the guest.
        let mut reply = Vec::new();
        loop {
            let byte = stream.read_u8().await?;
            if byte == b'\n' {
                break;
            }
            if reply.len() == MAX_REPLY {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "oversized vsock handshake reply",
                ));
            }
            reply.push(byte);
        }

        if !reply.starts_with(b"OK ") {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!(
                    "vsock port {port} refused: {:?}",
                    String::from_utf8_lossy(&reply)
                ),
            ));
        }
        debug!(port, "Connected to guest over vsock");
        Ok(Box::new(FullCloseOnly(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixListener;

    use crate::forward::ForwardStream;

    async fn fake_device(path: PathBuf, accept: bool) {
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            let port = line.trim().strip_prefix("CONNECT ").unwrap().to_string();
            let mut stream = stream.into_inner();
            if accept {
                stream.write_all(b"OK 1073741824\nguest:").await.unwrap();
                stream.write_all(port.as_bytes()).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_handshake_then_payload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v.sock");
        fake_device(path.clone(), true).await;

        let mut stream = HybridVsockDialer::new(&path).dial(10443).await.unwrap();
        assert!(!stream.supports_half_close());
        let mut rest = String::new();
        stream.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "guest:10443");
    }

    #[tokio::test]
    async fn test_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v.sock");
        fake_device(path.clone(), false).await;

        assert!(HybridVsockDialer::new(&path).dial(22).await.is_err());
    }
}
