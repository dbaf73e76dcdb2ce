//! In-process backend for tests.
//!
//! The "guest" is whatever listens at the configured TCP address, typically a
//! local HTTP mock. Guest-channel ports dial `127.0.0.1:<port>`.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Driver, DriverError, ErrorChannel};
use crate::forward::{BoxedStream, GuestDialer};

#[derive(Default)]
struct State {
    calls: Vec<&'static str>,
    errors: Option<mpsc::Sender<anyhow::Error>>,
    display_password: Option<String>,
}

#[derive(Default)]
pub struct MockDriver {
    guest: Option<SocketAddr>,
    start_error: Option<String>,
    display: Option<String>,
    address: Option<String>,
    gui: Option<Duration>,
    state: Mutex<State>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve guest connections from `addr`.
    pub fn with_guest(mut self, addr: SocketAddr) -> Self {
        self.guest = Some(addr);
        self
    }

    /// Make `start` fail synchronously.
    pub fn failing_start(mut self, message: impl Into<String>) -> Self {
        self.start_error = Some(message.into());
        self
    }

    /// Support display operations; `connection` is what the backend reports.
    pub fn with_display(mut self, connection: impl Into<String>) -> Self {
        self.display = Some(connection.into());
        self
    }

    /// Own a GUI loop that blocks its thread for `open`, then returns as if
    /// the window was closed.
    pub fn with_gui(mut self, open: Duration) -> Self {
        self.gui = Some(open);
        self
    }

    /// Report `address` as the SSH address after start.
    pub fn with_ssh_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Deliver `err` on the asynchronous error channel.
    pub async fn fail(&self, err: anyhow::Error) -> bool {
        let sender = self.lock().errors.clone();
        match sender {
            Some(tx) => tx.send(err).await.is_ok(),
            None => false,
        }
    }

    /// Driver methods invoked so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    pub fn display_password(&self) -> Option<String> {
        self.lock().display_password.clone()
    }

    fn record(&self, call: &'static str) {
        self.lock().calls.push(call);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct LoopbackDialer;

#[async_trait]
impl GuestDialer for LoopbackDialer {
    async fn dial(&self, port: u32) -> io::Result<BoxedStream> {
        let port = u16::try_from(port)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "port out of range"))?;
        Ok(Box::new(TcpStream::connect(("127.0.0.1", port)).await?))
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn start(&self, _cancel: CancellationToken) -> Result<ErrorChannel, DriverError> {
        self.record("start");
        if let Some(message) = &self.start_error {
            return Err(DriverError::Config(message.clone()));
        }
        let (tx, rx) = mpsc::channel(1);
        self.lock().errors = Some(tx);
        Ok(rx)
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.record("stop");
        self.lock().errors = None;
        Ok(())
    }

    async fn dialer(&self) -> Result<Arc<dyn GuestDialer>, DriverError> {
        Ok(Arc::new(LoopbackDialer))
    }

    async fn guest_connection(&self) -> Result<BoxedStream, DriverError> {
        let addr = self.guest.ok_or(DriverError::NotRunning)?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(DriverError::Connect)?;
        Ok(Box::new(stream))
    }

    async fn change_display_password(&self, password: &str) -> Result<(), DriverError> {
        if self.display.is_none() {
            return Err(DriverError::Unsupported("display password"));
        }
        self.record("change_display_password");
        self.lock().display_password = Some(password.to_string());
        Ok(())
    }

    async fn get_display_connection(&self) -> Result<String, DriverError> {
        self.display
            .clone()
            .ok_or(DriverError::Unsupported("display connection"))
    }

    fn can_run_gui(&self) -> bool {
        self.gui.is_some()
    }

    fn run_gui(&self) -> Result<(), DriverError> {
        let open = self.gui.ok_or(DriverError::Unsupported("GUI"))?;
        self.record("run_gui");
        std::thread::sleep(open);
        Ok(())
    }

    fn ssh_address(&self) -> Option<String> {
        self.address.clone()
    }
}
