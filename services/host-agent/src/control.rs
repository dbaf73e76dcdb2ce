//! Local control server.
//!
//! A small HTTP API on the instance's Unix socket. Today it only answers
//! `GET /health`.

use std::io;
use std::path::{Path, PathBuf};

use axum::{routing::get, Json, Router};
use hearth_spec::Healthy;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed to bind control socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("control server failed: {0}")]
    Serve(#[source] io::Error),

    #[error("control sockets are not supported on this host")]
    Unsupported,
}

pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

async fn health() -> Json<Healthy> {
    Json(Healthy::ok())
}

/// Bound control socket, not yet serving.
pub struct ControlServer {
    path: PathBuf,
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
}

impl ControlServer {
    /// Bind `path`, replacing a stale socket left by a previous agent.
    #[cfg(unix)]
    pub fn bind(path: &Path) -> Result<Self, ControlError> {
        let bind_err = |source| ControlError::Bind {
            path: path.to_path_buf(),
            source,
        };
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(bind_err(e)),
            _ => {}
        }
        let listener = tokio::net::UnixListener::bind(path).map_err(bind_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }

    #[cfg(not(unix))]
    pub fn bind(_path: &Path) -> Result<Self, ControlError> {
        Err(ControlError::Unsupported)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve until `cancel` fires; the socket file is removed afterwards.
    #[cfg(unix)]
    pub async fn serve(self, cancel: CancellationToken) -> Result<(), ControlError> {
        info!(socket = %self.path.display(), "Control server listening");
        let result = axum::serve(self.listener, router())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(ControlError::Serve);
        std::fs::remove_file(&self.path).ok();
        info!("Control server stopped");
        result
    }

    #[cfg(not(unix))]
    pub async fn serve(self, _cancel: CancellationToken) -> Result<(), ControlError> {
        Err(ControlError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health() {
        let response = router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let healthy: Healthy = serde_json::from_slice(&body).unwrap();
        assert!(healthy.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let response = router()
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bind_replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("control.sock");
        std::fs::write(&path, b"").unwrap();

        let server = ControlServer::bind(&path).unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.serve(cancel.clone()));

        tokio::net::UnixStream::connect(&path).await.unwrap();
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(!path.exists());
    }
}
