//! Client for the Firecracker API socket.

use std::path::{Path, PathBuf};

use hyper::{body::Buf, Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use super::config::{BootSource, DriveConfig, MachineConfig, NetworkInterface, VsockConfig};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{method} {path} returned {status}: {message}")]
    Status {
        method: Method,
        path: String,
        status: u16,
        message: String,
    },
}

#[derive(Serialize)]
struct Action {
    action_type: &'static str,
}

pub struct FirecrackerClient {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
}

impl FirecrackerClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::unix(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn put_machine_config(&self, config: &MachineConfig) -> Result<(), ApiError> {
        self.put("/machine-config", config).await
    }

    pub async fn put_boot_source(&self, config: &BootSource) -> Result<(), ApiError> {
        self.put("/boot-source", config).await
    }

    pub async fn put_drive(&self, config: &DriveConfig) -> Result<(), ApiError> {
        self.put(&format!("/drives/{}", config.drive_id), config).await
    }

    pub async fn put_network_interface(&self, config: &NetworkInterface) -> Result<(), ApiError> {
        self.put(&format!("/network-interfaces/{}", config.iface_id), config)
            .await
    }

    pub async fn put_vsock(&self, config: &VsockConfig) -> Result<(), ApiError> {
        self.put("/vsock", config).await
    }

    pub async fn start_instance(&self) -> Result<(), ApiError> {
        self.put("/actions", &Action {
            action_type: "InstanceStart",
        })
        .await
    }

    /// Ask the guest to shut down.
    pub async fn send_ctrl_alt_del(&self) -> Result<(), ApiError> {
        self.put("/actions", &Action {
            action_type: "SendCtrlAltDel",
        })
        .await
    }

    async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        let body = serde_json::to_vec(body)?;
        debug!(path, "PUT to Firecracker API");

        let request = Request::builder()
            .method(Method::PUT)
            .uri(Uri::new(&self.socket_path, path))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Body::from(body))?;

        let response = self.client.request(request).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = hyper::body::aggregate(response.into_body()).await?;
        let message = String::from_utf8_lossy(body.chunk()).trim().to_string();
        error!(path, status = %status, message = %message, "Firecracker API error");
        Err(ApiError::Status {
            method: Method::PUT,
            path: path.to_string(),
            status: status.as_u16(),
            message,
        })
    }
}
