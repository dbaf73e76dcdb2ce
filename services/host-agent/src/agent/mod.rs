//! Host agent orchestrator.
//!
//! [`HostAgent::run`] takes one instance from staged disks to a running guest
//! with forwards in place, then waits for cancellation or a backend failure
//! and tears everything down in reverse order.
//!
//! ```text
//! Booting ──▶ Running ──▶ Exiting
//!               │
//!               └──▶ Degraded (guest agent never answered)
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hearth_spec::{select_for_arch, PortForward, VirtualMachineSpec};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::cidata::{guest_binary_path, CidataError, CloudInit, IsoWriter};
use crate::control::{ControlError, ControlServer};
use crate::disk::{DiskError, DiskProvisioner, ImageConverter};
use crate::download::{DownloadError, Downloader};
use crate::driver::{Driver, DriverError, ErrorChannel};
use crate::events::{EventEmitter, Status};
use crate::forward::{Endpoint, ForwardError, ForwardManager, ForwardRule};
use crate::fsutil::ensure_dir;
use crate::instance::{Instance, InstanceError, HEARTBEAT_INTERVAL};
use crate::mapping::{run_mapping_loop, PortMapper, MAPPING_PERIOD};
use crate::ssh::{SshCapabilities, SshError, SshManager};

mod cleanup;
mod guest;
mod vnc;

pub use cleanup::CleanupStack;
pub use guest::{guest_get, wait_for_address, wait_for_guest_agent, GuestError};
pub use vnc::{generate_password, setup_vnc, VncDisplay, VncEndpoint, PASSWORD_CHARSET};

/// Guest port the cluster tunnel terminates on.
pub const GUEST_TUNNEL_PORT: u16 = 8132;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error("staging guest binary: {0}")]
    Download(#[from] DownloadError),

    #[error("no guest binary for architecture {0}")]
    NoGuestBinary(&'static str),

    #[error(transparent)]
    Cidata(#[from] CidataError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("backend: {0}")]
    Driver(#[from] DriverError),

    #[error("backend failed: {0:#}")]
    Backend(anyhow::Error),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("port forwarding: {0}")]
    Forward(#[from] ForwardError),

    #[error("guest did not report a running address within {0:?}")]
    AddressTimeout(Duration),

    #[error("guest agent did not respond within {0:?}; port forwards may not work")]
    GuestAgentTimeout(Duration),

    #[error("invalid VNC display {0}")]
    Vnc(String),

    #[error("GUI: {0}")]
    Gui(#[source] DriverError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl AgentError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        AgentError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Intervals and deadlines used by the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct AgentTimings {
    pub heartbeat: Duration,
    pub address_poll: Duration,
    pub address_timeout: Duration,
    pub guest_poll: Duration,
    pub guest_timeout: Duration,
    pub mapping_period: Duration,
}

impl Default for AgentTimings {
    fn default() -> Self {
        Self {
            heartbeat: HEARTBEAT_INTERVAL,
            address_poll: Duration::from_secs(5),
            address_timeout: Duration::from_secs(5 * 60),
            guest_poll: Duration::from_secs(1),
            guest_timeout: Duration::from_secs(60),
            mapping_period: MAPPING_PERIOD,
        }
    }
}

/// Collaborators the agent does not own the policy of.
pub struct AgentServices {
    pub downloader: Downloader,
    pub converter: Arc<dyn ImageConverter>,
    pub iso_writer: Arc<dyn IsoWriter>,
    pub mapper: Arc<dyn PortMapper>,
    pub ssh_caps: Arc<SshCapabilities>,
    pub events: Arc<EventEmitter>,
}

pub struct HostAgent {
    instance: Instance,
    driver: Arc<dyn Driver>,
    ssh: SshManager,
    downloader: Downloader,
    provisioner: DiskProvisioner,
    cloud_init: CloudInit,
    mapper: Arc<dyn PortMapper>,
    events: Arc<EventEmitter>,
    timings: AgentTimings,
    control_socket: PathBuf,
    cleanup: CleanupStack,
}

impl HostAgent {
    pub fn new(instance: Instance, driver: Arc<dyn Driver>, services: AgentServices) -> Self {
        let ssh = SshManager::new(&instance, services.ssh_caps);
        let control_socket = instance.control_socket();
        Self {
            ssh,
            driver,
            provisioner: DiskProvisioner::new(services.downloader.clone(), services.converter),
            downloader: services.downloader,
            cloud_init: CloudInit::new(services.iso_writer),
            mapper: services.mapper,
            events: services.events,
            timings: AgentTimings::default(),
            control_socket,
            cleanup: CleanupStack::new(),
            instance,
        }
    }

    pub fn with_timings(mut self, timings: AgentTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_ssh(mut self, ssh: SshManager) -> Self {
        self.ssh = ssh;
        self
    }

    pub fn with_control_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_socket = path.into();
        self
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Run the instance until `cancel` fires or the backend fails.
    ///
    /// The heartbeat runs for the whole call; the PID file is removed and an
    /// `exiting` event emitted on every return path.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), AgentError> {
        info!(instance = %self.instance.name(), backend = self.driver.name(), "Host agent starting");
        let local = cancel.child_token();

        if let Err(e) = ensure_dir(self.instance.dir()) {
            let err = AgentError::io(self.instance.dir(), e);
            error!(error = %err, "Host agent failed");
            self.emit_exiting();
            return Err(err);
        }

        let heartbeat = tokio::spawn(
            self.instance
                .heartbeat_writer()
                .run(self.timings.heartbeat, local.clone())
                .instrument(info_span!("heartbeat")),
        );

        let result = self.run_inner(&local).await;
        if let Err(e) = &result {
            error!(error = %e, "Host agent failed");
        }

        local.cancel();
        heartbeat.await.ok();
        if let Err(e) = self.instance.remove_pid() {
            warn!(error = %e, "Failed to remove pid file");
        }
        self.emit_exiting();
        result
    }

    fn emit_exiting(&self) {
        self.events.emit(Status {
            exiting: true,
            ssh_local_port: self.ssh.port(),
            ..Default::default()
        });
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> Result<(), AgentError> {
        self.gen_disk().await?;

        let errors = self.driver.start(cancel.clone()).await?;
        let result = self.supervise(errors, cancel).await;

        info!("Shutting down the host agent");
        for e in self.cleanup.run().await {
            warn!(error = %format!("{e:#}"), "Error during shutdown");
        }
        let stopped = self.driver.stop().await;
        match (result, stopped) {
            (Err(e), Err(stop)) => {
                warn!(error = %stop, "Failed to stop backend");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), stopped) => Ok(stopped?),
        }
    }

    /// Stage the guest binary, the writable disk and the configuration disk.
    pub async fn gen_disk(&self) -> Result<(), AgentError> {
        let binary = guest_binary_path(&self.instance);
        if !binary.exists() {
            let spec = self.instance.spec();
            let file = select_for_arch(&spec.guest_binaries, spec.arch)
                .ok_or(AgentError::NoGuestBinary(spec.arch.as_str()))?;
            self.downloader.fetch(file, &binary).await?;
            info!(path = %binary.display(), "Staged guest binary");
        }

        self.provisioner.ensure_disk(&self.instance).await?;

        let keys = self.ssh.load_pub_key()?;
        self.cloud_init
            .create_boot_disk(&self.instance, self.ssh.user(), &keys)
            .await?;
        Ok(())
    }

    async fn supervise(
        &mut self,
        errors: ErrorChannel,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        if let Some(address) = self.driver.ssh_address() {
            info!(address = %address, "Backend reported SSH address");
            self.ssh.set_address(address.clone());
            self.instance.ssh_address = address;
        }
        if let Err(e) = self.ssh.write_config_file() {
            warn!(error = %e, "Failed to write ssh config");
        }
        let ssh = self.ssh.clone();
        self.cleanup.push("ssh control master", move || async move {
            ssh.exit_control_master()?;
            Ok(())
        });

        self.start_control_server(cancel)?;

        let mapping_cancel = cancel.child_token();
        let mapping = tokio::spawn(
            run_mapping_loop(
                self.instance.spec().clone(),
                self.mapper.clone(),
                self.timings.mapping_period,
                mapping_cancel.clone(),
            )
            .instrument(info_span!("mapping")),
        );
        self.cleanup.push("port mapping", move || async move {
            mapping_cancel.cancel();
            mapping.await?;
            Ok(())
        });

        if self.instance.spec().video.wants_vnc() {
            setup_vnc(self.driver.as_ref(), &self.instance).await?;
        }

        let forwards = Arc::new(ForwardManager::new(cancel.child_token()));
        {
            let forwards = forwards.clone();
            self.cleanup.push("port forwards", move || async move {
                forwards.stop_all().await;
                Ok(())
            });
        }

        let routines = Routines {
            name: self.instance.name().to_string(),
            spec: self.instance.spec().clone(),
            driver: self.driver.clone(),
            forwards,
            events: self.events.clone(),
            timings: self.timings,
            ssh_local_port: self.ssh.port(),
        };

        if !self.driver.can_run_gui() {
            return routines.start_and_wait(errors, cancel.clone()).await;
        }

        // The GUI loop owns a blocking thread; startup runs beside it.
        let mut waiter = tokio::spawn(routines.start_and_wait(errors, cancel.clone()));
        let driver = self.driver.clone();
        let mut gui = tokio::task::spawn_blocking(move || driver.run_gui());

        tokio::select! {
            closed = &mut gui => {
                info!("GUI loop returned");
                cancel.cancel();
                let waited = join_startup(waiter.await);
                match closed {
                    Ok(result) => result.map_err(AgentError::Gui)?,
                    Err(e) => return Err(AgentError::Backend(anyhow::anyhow!("GUI task: {e}"))),
                }
                waited
            }
            waited = &mut waiter => {
                // The loop ends on its own once the backend stops.
                info!("Startup routines returned before the GUI loop");
                join_startup(waited)
            }
        }
    }

    /// Bind the control socket and serve it in the background.
    ///
    /// A bind failure aborts the run. The server failing later takes the whole
    /// process down.
    fn start_control_server(&mut self, cancel: &CancellationToken) -> Result<(), AgentError> {
        let server = match ControlServer::bind(&self.control_socket) {
            Ok(server) => server,
            Err(ControlError::Unsupported) => {
                warn!("Control socket not supported on this host, skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let control_cancel = cancel.child_token();
        let task = tokio::spawn({
            let control_cancel = control_cancel.clone();
            async move {
                if let Err(e) = server.serve(control_cancel).await {
                    error!(error = %e, "Control server failed, exiting");
                    std::process::exit(1);
                }
            }
            .instrument(info_span!("control"))
        });
        self.cleanup.push("control server", move || async move {
            control_cancel.cancel();
            task.await?;
            Ok(())
        });
        Ok(())
    }
}

fn join_startup(
    joined: Result<Result<(), AgentError>, tokio::task::JoinError>,
) -> Result<(), AgentError> {
    joined.unwrap_or_else(|e| Err(AgentError::Backend(anyhow::anyhow!("startup task: {e}"))))
}

/// State the startup routines need after `run` hands off.
#[derive(Clone)]
struct Routines {
    name: String,
    spec: Arc<VirtualMachineSpec>,
    driver: Arc<dyn Driver>,
    forwards: Arc<ForwardManager>,
    events: Arc<EventEmitter>,
    timings: AgentTimings,
    ssh_local_port: u16,
}

impl Routines {
    fn base_status(&self) -> Status {
        Status {
            ssh_local_port: self.ssh_local_port,
            ..Default::default()
        }
    }

    async fn start_and_wait(
        self,
        mut errors: ErrorChannel,
        cancel: CancellationToken,
    ) -> Result<(), AgentError> {
        self.events.emit(self.base_status());

        let (forward_tx, mut forward_rx) = mpsc::channel(1);
        let boot = tokio::spawn(self.clone().boot(forward_tx).instrument(info_span!("boot")));

        let result = tokio::select! {
            err = errors.recv() => match err {
                Some(e) => {
                    warn!(error = %format!("{e:#}"), "Backend stopped due to error");
                    Err(AgentError::Backend(e))
                }
                None => {
                    info!("Backend stopped");
                    Ok(())
                }
            },
            Some(e) = forward_rx.recv() => {
                warn!(error = %e, "Port forwarding failed");
                Err(e)
            }
            _ = cancel.cancelled() => {
                info!("Cancelled, shutting down the host agent");
                Ok(())
            }
        };
        boot.abort();
        result
    }

    async fn boot(self, failures: mpsc::Sender<AgentError>) {
        if let Err(e) = self.set_port_forward().await {
            failures.send(e).await.ok();
            return;
        }

        let mut status = self.base_status();
        status.running = true;
        info!("Waiting for the guest agent to be running");
        match wait_for_guest_agent(
            self.driver.as_ref(),
            self.timings.guest_poll,
            self.timings.guest_timeout,
        )
        .await
        {
            Ok(()) => info!("Guest agent is running"),
            Err(e) => {
                warn!(error = %e, "Guest agent degraded");
                status.degraded = true;
                status.errors.push(e.to_string());
            }
        }
        self.events.emit(status);
    }

    /// Wait for the guest address, then register every forward.
    async fn set_port_forward(&self) -> Result<(), AgentError> {
        let address = wait_for_address(
            self.driver.as_ref(),
            &self.name,
            self.timings.address_poll,
            self.timings.address_timeout,
        )
        .await?;

        let mut rules = Vec::new();
        for pf in &self.spec.port_forwards {
            rules.push(ForwardRule::from_port_forward(pf, &address)?);
        }
        if self.spec.access_point.tunnel_port != 0 {
            let tunnel = PortForward {
                host_ip: "0.0.0.0".to_string(),
                host_port: self.spec.access_point.tunnel_port,
                guest_port: GUEST_TUNNEL_PORT,
                ..Default::default()
            };
            rules.push(ForwardRule::from_port_forward(&tunnel, &address)?);
        }

        let needs_dialer = rules
            .iter()
            .any(|r| matches!(r.destination, Endpoint::Vsock(_)));
        let dialer = if needs_dialer {
            Some(self.driver.dialer().await?)
        } else {
            None
        };

        for rule in rules {
            let dialer = match rule.destination {
                Endpoint::Vsock(_) => dialer.clone(),
                _ => None,
            };
            self.forwards.add_rule(rule, dialer).await?;
        }
        info!(count = self.forwards.rules().len(), "Port forwards in place");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let timings = AgentTimings::default();
        assert_eq!(timings.heartbeat, Duration::from_secs(15));
        assert_eq!(timings.address_poll, Duration::from_secs(5));
        assert_eq!(timings.address_timeout, Duration::from_secs(300));
        assert_eq!(timings.guest_timeout, Duration::from_secs(60));
        assert_eq!(timings.mapping_period, Duration::from_secs(300));
    }

    #[test]
    fn test_backend_error_keeps_chain() {
        let err = AgentError::Backend(anyhow::anyhow!("exit status 1").context("firecracker exited"));
        assert_eq!(err.to_string(), "backend failed: firecracker exited: exit status 1");
    }
}
