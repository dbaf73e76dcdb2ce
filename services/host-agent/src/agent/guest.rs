//! HTTP calls to the guest agent over the backend's guest connection.

use std::time::Duration;

use hearth_networking::Ipv4Prefix;
use hearth_spec::{guest_info_path, GuestInfo, Healthy};
use hyper::header::HOST;
use hyper::{Body, Request};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::AgentError;
use crate::driver::{Driver, DriverError};

#[derive(Debug, Error)]
pub enum GuestError {
    #[error(transparent)]
    Connect(#[from] DriverError),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("GET {path} returned {status}")]
    Status { path: String, status: u16 },

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// One `GET` on a fresh guest connection, decoded as JSON.
pub async fn guest_get<T: DeserializeOwned>(
    driver: &dyn Driver,
    path: &str,
) -> Result<T, GuestError> {
    let stream = driver.guest_connection().await?;
    let (mut sender, connection) = hyper::client::conn::handshake(stream).await?;
    let _connection = AbortOnDrop(tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Guest connection closed with error");
        }
    }));

    let request = Request::get(path)
        .header(HOST, "guest")
        .body(Body::empty())?;
    let response = sender.send_request(request).await?;
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await?;
    if !status.is_success() {
        return Err(GuestError::Status {
            path: path.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(serde_json::from_slice(&body)?)
}

/// Tears the connection task down with the request that owns it.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// First address of a running guest inside the private VM subnet.
fn running_address(info: &GuestInfo) -> Option<String> {
    if !info.is_running() {
        return None;
    }
    let subnet = Ipv4Prefix::private_vm_subnet();
    info.spec
        .address
        .iter()
        .find(|a| subnet.contains_str(a))
        .map(|a| a.trim().split('/').next().unwrap_or_default().to_string())
}

/// Poll the guest info resource until the guest runs with a private address.
pub async fn wait_for_address(
    driver: &dyn Driver,
    name: &str,
    poll: Duration,
    timeout: Duration,
) -> Result<String, AgentError> {
    let path = guest_info_path(name);
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, guest_get::<GuestInfo>(driver, &path)).await {
            Err(_) => return Err(AgentError::AddressTimeout(timeout)),
            Ok(Ok(info)) => {
                if let Some(address) = running_address(&info) {
                    info!(address = %address, "Guest reported its address");
                    return Ok(address);
                }
                debug!(phase = %info.status.phase, addresses = ?info.spec.address, "Guest not ready");
            }
            Ok(Err(e)) => debug!(error = %e, "Guest info not available yet"),
        }
        if Instant::now() + poll > deadline {
            return Err(AgentError::AddressTimeout(timeout));
        }
        tokio::time::sleep(poll).await;
    }
}

/// Poll `/health` until the guest agent answers `ok`.
pub async fn wait_for_guest_agent(
    driver: &dyn Driver,
    poll: Duration,
    timeout: Duration,
) -> Result<(), AgentError> {
    let attempt = async {
        loop {
            match guest_get::<Healthy>(driver, "/health").await {
                Ok(healthy) if healthy.is_ok() => return,
                Ok(healthy) => debug!(status = %healthy.status, "Guest agent not healthy yet"),
                Err(e) => debug!(error = %e, "Guest agent not reachable yet"),
            }
            tokio::time::sleep(poll).await;
        }
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| AgentError::GuestAgentTimeout(timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use hearth_spec::{GuestInfoSpec, GuestInfoStatus};
    use tokio::net::TcpListener;

    fn info(phase: &str, address: &[&str]) -> GuestInfo {
        GuestInfo {
            spec: GuestInfoSpec {
                address: address.iter().map(|a| a.to_string()).collect(),
            },
            status: GuestInfoStatus {
                phase: phase.to_string(),
            },
        }
    }

    #[test]
    fn test_running_address() {
        assert_eq!(
            running_address(&info("Running", &["10.0.2.15/24", "192.168.7.2/24"])).as_deref(),
            Some("192.168.7.2")
        );
        assert_eq!(running_address(&info("Pending", &["192.168.7.2"])), None);
        assert_eq!(running_address(&info("Running", &["172.17.0.2"])), None);
        assert_eq!(running_address(&info("Running", &[])), None);
    }

    /// Accepts connections and never writes a byte.
    async fn silent_guest() -> (std::net::SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((conn, _)) = listener.accept().await {
                held.push(conn);
            }
        });
        (addr, task)
    }

    #[tokio::test]
    async fn test_wait_for_address_bounds_unresponsive_guest() {
        let (addr, guest) = silent_guest().await;
        let driver = MockDriver::new().with_guest(addr);

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_address(&driver, "dev", Duration::from_millis(50), Duration::from_millis(300)),
        )
        .await
        .expect("wait_for_address did not honour its deadline");

        assert!(matches!(result, Err(AgentError::AddressTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
        guest.abort();
    }

    #[tokio::test]
    async fn test_wait_for_guest_agent_bounds_unresponsive_guest() {
        let (addr, guest) = silent_guest().await;
        let driver = MockDriver::new().with_guest(addr);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_guest_agent(&driver, Duration::from_millis(50), Duration::from_millis(300)),
        )
        .await
        .expect("wait_for_guest_agent did not honour its deadline");

        assert!(matches!(result, Err(AgentError::GuestAgentTimeout(_))));
        guest.abort();
    }
}
