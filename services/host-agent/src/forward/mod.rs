//! Host → guest port forwarding.
//!
//! Each rule owns one listener task. Every accepted connection is dialed
//! through to its destination and handed to [`bicopy`] on its own task, so a
//! slow connection never holds up the listener or its siblings.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hearth_networking::NetworkError;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

mod bicopy;
mod rule;
mod stream;

pub use bicopy::bicopy;
pub use rule::{Endpoint, ForwardRule};
pub use stream::{BoxedStream, ForwardStream, FullCloseOnly};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Errors from forward setup.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid forward rule: {0}")]
    InvalidRule(String),

    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),

    #[error(transparent)]
    Address(#[from] NetworkError),

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("no guest dialer for vsock port {0}")]
    NoDialer(u32),
}

/// Opens connections on the backend's guest channel.
#[async_trait]
pub trait GuestDialer: Send + Sync {
    async fn dial(&self, port: u32) -> io::Result<BoxedStream>;
}

/// Where a forward ended up listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bound {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl Listener {
    async fn bind(source: &Endpoint) -> Result<(Self, Bound), ForwardError> {
        match source {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str())
                    .await
                    .map_err(|e| ForwardError::Listen {
                        addr: addr.clone(),
                        source: e,
                    })?;
                let local = listener.local_addr().map_err(|e| ForwardError::Listen {
                    addr: addr.clone(),
                    source: e,
                })?;
                Ok((Listener::Tcp(listener), Bound::Tcp(local)))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                remove_stale_socket(path);
                let listener = UnixListener::bind(path).map_err(|e| ForwardError::Listen {
                    addr: path.display().to_string(),
                    source: e,
                })?;
                Ok((
                    Listener::Unix(listener, path.clone()),
                    Bound::Unix(path.clone()),
                ))
            }
            other => Err(ForwardError::InvalidRule(format!("cannot listen on {other}"))),
        }
    }

    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true).ok();
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), path.display().to_string()))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Listener::Unix(_, path) = self {
            std::fs::remove_file(path).ok();
        }
    }
}

#[cfg(unix)]
fn remove_stale_socket(path: &Path) {
    use std::os::unix::fs::FileTypeExt;

    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_socket() {
            debug!(path = %path.display(), "Removing stale socket");
            std::fs::remove_file(path).ok();
        }
    }
}

async fn dial(
    destination: &Endpoint,
    dialer: Option<&dyn GuestDialer>,
) -> Result<BoxedStream, ForwardError> {
    match destination {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str())
                .await
                .map_err(|source| ForwardError::Dial {
                    addr: addr.clone(),
                    source,
                })?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path)
                .await
                .map_err(|source| ForwardError::Dial {
                    addr: path.display().to_string(),
                    source,
                })?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(ForwardError::UnsupportedProtocol("unix".into())),
        Endpoint::Vsock(port) => {
            let dialer = dialer.ok_or(ForwardError::NoDialer(*port))?;
            dialer.dial(*port).await.map_err(|source| ForwardError::Dial {
                addr: destination.to_string(),
                source,
            })
        }
    }
}

struct Forwarder {
    quit: CancellationToken,
    task: JoinHandle<()>,
}

impl Forwarder {
    async fn stop(self) {
        self.quit.cancel();
        self.task.await.ok();
    }
}

/// Registry of active forwards.
pub struct ForwardManager {
    cancel: CancellationToken,
    forwarders: Mutex<HashMap<String, Forwarder>>,
}

impl ForwardManager {
    /// Forwards stop when `cancel` fires.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    /// Add a rule whose destination is reachable from the host.
    pub async fn add(&self, rule: &str) -> Result<Bound, ForwardError> {
        self.add_by(rule, None).await
    }

    /// Parse `rule`, listen on its source, and forward every connection.
    ///
    /// Guest channel destinations go through `dialer`. Listener failures are
    /// returned here; dial failures only close the accepted connection.
    pub async fn add_by(
        &self,
        rule: &str,
        dialer: Option<Arc<dyn GuestDialer>>,
    ) -> Result<Bound, ForwardError> {
        let rule: ForwardRule = rule.parse()?;
        self.add_rule(rule, dialer).await
    }

    /// Register an already parsed rule, replacing any forward with the same text.
    pub async fn add_rule(
        &self,
        rule: ForwardRule,
        dialer: Option<Arc<dyn GuestDialer>>,
    ) -> Result<Bound, ForwardError> {
        if let (Endpoint::Vsock(port), None) = (&rule.destination, &dialer) {
            return Err(ForwardError::NoDialer(*port));
        }

        let key = rule.to_string();
        if let Some(old) = self.take(&key) {
            info!(rule = %key, "Replacing forward");
            old.stop().await;
        }

        let (listener, bound) = Listener::bind(&rule.source).await?;
        let quit = self.cancel.child_token();
        let span = info_span!("forward", rule = %key);
        let task = tokio::spawn(
            serve(listener, rule.destination, dialer, quit.clone()).instrument(span),
        );

        info!(rule = %key, bound = ?bound, "Forwarding");
        self.lock().insert(key, Forwarder { quit, task });
        Ok(bound)
    }

    /// Stop the forward registered for `rule`. Returns whether one existed.
    pub async fn remove(&self, rule: &str) -> Result<bool, ForwardError> {
        let key = rule.parse::<ForwardRule>()?.to_string();
        match self.take(&key) {
            Some(forwarder) => {
                forwarder.stop().await;
                info!(rule = %key, "Stopped forward");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn stop_all(&self) {
        let all: Vec<Forwarder> = self.lock().drain().map(|(_, f)| f).collect();
        let count = all.len();
        for forwarder in all {
            forwarder.stop().await;
        }
        if count > 0 {
            info!(count, "Stopped all forwards");
        }
    }

    pub fn rules(&self) -> Vec<String> {
        let mut rules: Vec<String> = self.lock().keys().cloned().collect();
        rules.sort();
        rules
    }

    fn take(&self, key: &str) -> Option<Forwarder> {
        self.lock().remove(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Forwarder>> {
        self.forwarders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn serve(
    listener: Listener,
    destination: Endpoint,
    dialer: Option<Arc<dyn GuestDialer>>,
    quit: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = quit.cancelled() => break,
            res = listener.accept() => res,
        };
        let (inbound, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let destination = destination.clone();
        let dialer = dialer.clone();
        let quit = quit.clone();
        let span = info_span!("connection", peer = %peer);
        tokio::spawn(
            async move {
                let outbound = match dial(&destination, dialer.as_deref()).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "Dial failed, closing connection");
                        return;
                    }
                };
                debug!(destination = %destination, "Connected");
                bicopy(inbound, outbound, quit).await;
            }
            .instrument(span),
        );
    }
    debug!("Listener stopped");
}
