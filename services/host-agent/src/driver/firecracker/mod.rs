//! Firecracker backend.
//!
//! One `firecracker` process per instance, configured over its API socket.
//! The root drive is the instance's writable disk; the cidata ISO and any
//! attached data disks follow. Guest connections use hybrid vsock.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use hearth_spec::VirtualMachineSpec;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{guest_link, Driver, DriverConfig, DriverError, ErrorChannel, GUEST_AGENT_PORT};
use crate::forward::{BoxedStream, GuestDialer};
use crate::instance::{filenames, Dirs, Instance, MountDisk};

mod api;
mod config;
mod tap;
mod vsock;

pub use api::{ApiError, FirecrackerClient};
pub use tap::tap_name;
pub use vsock::HybridVsockDialer;

use self::config::{BootSource, DriveConfig, MachineConfig, NetworkInterface, VsockConfig, GUEST_CID};
use self::tap::TapDevice;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

impl From<ApiError> for DriverError {
    fn from(e: ApiError) -> Self {
        DriverError::Api(e.to_string())
    }
}

struct Running {
    client: FirecrackerClient,
    stopping: Arc<AtomicBool>,
    kill: CancellationToken,
    watcher: JoinHandle<()>,
    taps: Vec<TapDevice>,
    disks: Vec<MountDisk>,
}

pub struct FirecrackerDriver {
    name: String,
    dir: PathBuf,
    dirs: Dirs,
    spec: Arc<VirtualMachineSpec>,
    cpus: u32,
    memory_bytes: u64,
    firecracker_bin: PathBuf,
    kernel: Option<PathBuf>,
    running: Mutex<Option<Running>>,
}

impl FirecrackerDriver {
    pub fn new(instance: &Instance, config: &DriverConfig) -> Self {
        Self {
            name: instance.name().to_string(),
            dir: instance.dir().to_path_buf(),
            dirs: instance.dirs().clone(),
            spec: instance.spec().clone(),
            cpus: instance.cpus,
            memory_bytes: instance.memory_bytes,
            firecracker_bin: config.firecracker_bin.clone(),
            kernel: config.kernel.clone(),
            running: Mutex::new(None),
        }
    }

    fn api_socket(&self) -> PathBuf {
        self.dir.join(filenames::FC_SOCK)
    }

    fn vsock_socket(&self) -> PathBuf {
        self.dir.join(filenames::VSOCK_SOCK)
    }

    fn spawn_vmm(&self) -> Result<Child, DriverError> {
        let serial_path = self.dir.join(filenames::SERIAL_LOG);
        let serial =
            std::fs::File::create(&serial_path).map_err(|e| DriverError::io(&serial_path, e))?;
        let serial_err = serial
            .try_clone()
            .map_err(|e| DriverError::io(&serial_path, e))?;

        Command::new(&self.firecracker_bin)
            .arg("--api-sock")
            .arg(self.api_socket())
            .arg("--id")
            .arg(&self.name)
            .stdin(Stdio::null())
            .stdout(Stdio::from(serial))
            .stderr(Stdio::from(serial_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DriverError::Spawn {
                program: self.firecracker_bin.display().to_string(),
                source,
            })
    }

    async fn configure(
        &self,
        client: &FirecrackerClient,
        kernel: &Path,
        taps: &mut Vec<TapDevice>,
        disks: &mut Vec<MountDisk>,
    ) -> Result<(), DriverError> {
        client
            .put_machine_config(&MachineConfig::from_sizes(self.cpus, self.memory_bytes))
            .await?;
        let root = DriveConfig::root_for(&self.dir);
        if root.is_read_only {
            warn!(path = %root.path_on_host.display(), "No writable disk, attaching base image read-only");
        }
        client
            .put_boot_source(&BootSource::new(kernel.to_path_buf(), &root))
            .await?;
        client.put_drive(&root).await?;

        let cidata = self.dir.join(filenames::CIDATA_ISO);
        if cidata.exists() {
            client.put_drive(&DriveConfig::cidata(cidata)).await?;
        }

        for name in &self.spec.additional_disks {
            let mut disk = MountDisk::inspect(&self.dirs, name)?;
            disk.lock(&self.dir)?;
            let path = disk.data_path();
            disks.push(disk);
            client.put_drive(&DriveConfig::data(name, path)).await?;
        }

        for (index, network) in self.spec.networks.iter().enumerate() {
            let tap = TapDevice::create(
                &tap_name(&self.name, index),
                &guest_link(&self.name, index),
            )?;
            let iface = NetworkInterface {
                iface_id: if network.interface.is_empty() {
                    format!("eth{index}")
                } else {
                    network.interface.clone()
                },
                host_dev_name: tap.name().to_string(),
                guest_mac: Some(network.mac_address.clone()).filter(|m| !m.is_empty()),
            };
            taps.push(tap);
            client.put_network_interface(&iface).await?;
        }

        client
            .put_vsock(&VsockConfig {
                guest_cid: GUEST_CID,
                uds_path: self.vsock_socket(),
            })
            .await?;

        client.start_instance().await?;
        Ok(())
    }

    fn remove_sockets(&self) {
        std::fs::remove_file(self.api_socket()).ok();
        std::fs::remove_file(self.vsock_socket()).ok();
    }
}

async fn wait_for_socket(path: &Path) -> bool {
    let deadline = tokio::time::Instant::now() + SOCKET_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    path.exists()
}

fn unlock_all(disks: &mut [MountDisk]) {
    for disk in disks {
        if let Err(e) = disk.unlock() {
            warn!(disk = %disk.name, error = %e, "Failed to unlock data disk");
        }
    }
}

#[async_trait]
impl Driver for FirecrackerDriver {
    fn name(&self) -> &'static str {
        "firecracker"
    }

    async fn start(&self, _cancel: CancellationToken) -> Result<ErrorChannel, DriverError> {
        let kernel = self.kernel.clone().ok_or_else(|| {
            DriverError::Config("no kernel image configured (set HEARTH_KERNEL)".to_string())
        })?;

        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(DriverError::Config("already started".to_string()));
        }

        self.remove_sockets();
        let mut child = self.spawn_vmm()?;
        info!(instance = %self.name, pid = ?child.id(), "Started firecracker");

        if !wait_for_socket(&self.api_socket()).await {
            child.kill().await.ok();
            return Err(DriverError::Timeout("firecracker API socket"));
        }

        let client = FirecrackerClient::new(self.api_socket());
        let mut taps = Vec::new();
        let mut disks = Vec::new();
        if let Err(e) = self.configure(&client, &kernel, &mut taps, &mut disks).await {
            warn!(instance = %self.name, error = %e, "Failed to configure VM");
            child.kill().await.ok();
            unlock_all(&mut disks);
            self.remove_sockets();
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(1);
        let stopping = Arc::new(AtomicBool::new(false));
        let kill = CancellationToken::new();
        let watcher = {
            let stopping = stopping.clone();
            let kill = kill.clone();
            tokio::spawn(
                async move {
                    tokio::select! {
                        status = child.wait() => {
                            if stopping.load(Ordering::SeqCst) {
                                debug!(status = ?status, "firecracker exited");
                                return;
                            }
                            let err = match status {
                                Ok(status) => anyhow!("firecracker exited unexpectedly: {status}"),
                                Err(e) => anyhow!("waiting for firecracker: {e}"),
                            };
                            tx.send(err).await.ok();
                        }
                        _ = kill.cancelled() => {
                            if let Err(e) = child.kill().await {
                                warn!(error = %e, "Failed to kill firecracker");
                            }
                        }
                    }
                }
                .instrument(info_span!("firecracker", instance = %self.name)),
            )
        };

        info!(instance = %self.name, "VM started");
        *running = Some(Running {
            client,
            stopping,
            kill,
            watcher,
            taps,
            disks,
        });
        Ok(rx)
    }

    async fn stop(&self) -> Result<(), DriverError> {
        let Some(mut running) = self.running.lock().await.take() else {
            return Ok(());
        };
        running.stopping.store(true, Ordering::SeqCst);

        let graceful = match running.client.send_ctrl_alt_del().await {
            Ok(()) => true,
            Err(e) => {
                warn!(instance = %self.name, error = %e, "CtrlAltDel failed, killing");
                false
            }
        };

        let exited = graceful
            && tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut running.watcher)
                .await
                .is_ok();
        if !exited {
            if graceful {
                warn!(instance = %self.name, "Guest did not shut down in time, killing");
            }
            running.kill.cancel();
            (&mut running.watcher).await.ok();
        }

        unlock_all(&mut running.disks);
        drop(running.taps);
        self.remove_sockets();
        info!(instance = %self.name, "VM stopped");
        Ok(())
    }

    async fn dialer(&self) -> Result<Arc<dyn GuestDialer>, DriverError> {
        if self.running.lock().await.is_none() {
            return Err(DriverError::NotRunning);
        }
        Ok(Arc::new(HybridVsockDialer::new(self.vsock_socket())))
    }

    async fn guest_connection(&self) -> Result<BoxedStream, DriverError> {
        HybridVsockDialer::new(self.vsock_socket())
            .dial(GUEST_AGENT_PORT)
            .await
            .map_err(DriverError::Connect)
    }
}
