//! Instance model.
//!
//! An [`Instance`] is the on-disk identity of one VM: a directory derived from
//! a validated name, a PID heartbeat, and a protection marker. Its status is
//! never stored; [`Instance::inspect`] recomputes it from those files every
//! time.
//!
//! ## Layout
//!
//! ```text
//! <home>/<name>/
//! ├── hostagent.pid   heartbeat written by the running agent
//! ├── protected       empty marker
//! ├── basedisk        staged base image (read-only after staging)
//! ├── diffdisk        per-instance writable disk
//! ├── cidata.iso      guest configuration
//! ├── ssh.config      client config for external tools
//! └── vncpassword / vncdisplay
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hearth_networking::MacAddress;
use hearth_spec::{parse_ram_size, Network, SpecError, VirtualMachineSpec};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::fsutil::{ensure_dir, write_file_mode};

const DEFAULT_SSH_LOCAL_PORT: u16 = 60022;

mod heartbeat;
mod mountdisk;
mod paths;
mod process;

pub use heartbeat::{
    load_heartbeat, write_heartbeat, HeartbeatWriter, PidHeartbeat, HEARTBEAT_INTERVAL,
};
pub use mountdisk::{MountDisk, DATA_DISK, IN_USE_BY};
pub use paths::{control_socket_path, filenames, validate_name, Dirs, HOME_ENV, UNIX_PATH_MAX};
pub use process::{interrupt, is_process_alive, Interrupt};

/// Errors from the instance model.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("invalid instance name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("cannot determine home directory")]
    NoHomeDir,

    #[error("invalid {field} size: {source}")]
    Size {
        field: &'static str,
        #[source]
        source: SpecError,
    },

    #[error("corrupt pid file {path}: {reason}")]
    CorruptPid { path: PathBuf, reason: String },

    #[error("signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("disk {0:?} not found")]
    DiskNotFound(String),

    #[error("disk {disk:?} is already in use by {holder}")]
    AlreadyLocked { disk: String, holder: PathBuf },

    #[error("no free local port for ssh, forward guest port 22 explicitly: {0}")]
    SshPort(#[source] io::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl InstanceError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        InstanceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Derived lifecycle phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum Phase {
    #[default]
    Uninitialized,
    Installing,
    Broken,
    Stopped,
    Running,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstanceStatus {
    pub phase: Phase,
    pub errors: Vec<String>,
}

/// One managed VM.
#[derive(Debug, Clone)]
pub struct Instance {
    spec: Arc<VirtualMachineSpec>,
    dirs: Dirs,
    dir: PathBuf,

    pub cpus: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub ssh_address: String,
    pub ssh_local_port: u16,
    pub host_agent_pid: Option<u32>,
    pub driver_pid: Option<u32>,
    pub protected: bool,
    pub status: InstanceStatus,
}

impl Instance {
    /// Build the instance for `spec` rooted at `dirs`.
    ///
    /// Fills in a default NAT network when none is declared and inspects the
    /// directory to compute the initial status.
    pub fn new(mut spec: VirtualMachineSpec, dirs: Dirs) -> Result<Self, InstanceError> {
        let dir = dirs.instance_dir(&spec.name)?;

        if spec.networks.is_empty() {
            let seed = if spec.uid.is_empty() {
                spec.name.as_str()
            } else {
                spec.uid.as_str()
            };
            spec.networks.push(Network {
                mode: "nat".to_string(),
                interface: "eth0".to_string(),
                mac_address: MacAddress::generate(seed).to_string(),
            });
        }

        let (cpus, memory_bytes, disk_bytes) = if spec.vm_type.manages_own_resources() {
            (0, 0, 0)
        } else {
            let memory = parse_ram_size(&spec.memory).map_err(|source| InstanceError::Size {
                field: "memory",
                source,
            })?;
            let disk = parse_ram_size(&spec.disk).map_err(|source| InstanceError::Size {
                field: "disk",
                source,
            })?;
            (spec.cpus, memory, disk)
        };

        let ssh_local_port = ssh_local_port(&spec)?;

        let mut instance = Self {
            spec: Arc::new(spec),
            dirs,
            dir,
            cpus,
            memory_bytes,
            disk_bytes,
            ssh_address: "127.0.0.1".to_string(),
            ssh_local_port,
            host_agent_pid: None,
            driver_pid: None,
            protected: false,
            status: InstanceStatus::default(),
        };
        instance.inspect();
        Ok(instance)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &Arc<VirtualMachineSpec> {
        &self.spec
    }

    pub fn dirs(&self) -> &Dirs {
        &self.dirs
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a file inside the instance directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.file(filenames::PID_FILE)
    }

    pub fn protected_marker(&self) -> PathBuf {
        self.file(filenames::PROTECTED)
    }

    pub fn ssh_config_path(&self) -> PathBuf {
        self.file(filenames::SSH_CONFIG)
    }

    pub fn control_socket(&self) -> PathBuf {
        control_socket_path(self.name())
    }

    /// Recompute `status`, `host_agent_pid` and `protected` from disk.
    pub fn inspect(&mut self) {
        self.status = InstanceStatus::default();
        self.host_agent_pid = None;
        self.protected = self.protected_marker().symlink_metadata().is_ok();

        if !self.dir.is_dir() {
            self.status.phase = Phase::Uninitialized;
            return;
        }

        match load_heartbeat(&self.pid_file()) {
            Ok(Some(heartbeat)) => {
                self.host_agent_pid = Some(heartbeat.pid);
                self.status.phase = Phase::Running;
            }
            Ok(None) => {
                self.status.phase = if self.disk_installed() {
                    Phase::Stopped
                } else {
                    Phase::Installing
                };
            }
            Err(e) => {
                self.status.errors.push(e.to_string());
                self.status.phase = Phase::Broken;
            }
        }
    }

    /// The writable disk exists, or no size was declared and the base image
    /// is staged.
    fn disk_installed(&self) -> bool {
        if self.file(filenames::DIFF_DISK).exists() {
            return true;
        }
        matches!(parse_ram_size(&self.spec.disk), Ok(0))
            && self.file(filenames::BASE_DISK).exists()
    }

    /// Load the heartbeat; stale files are removed and reported as `None`.
    pub fn load_pid(&self) -> Result<Option<PidHeartbeat>, InstanceError> {
        load_heartbeat(&self.pid_file())
    }

    /// Heartbeat writer bound to this instance's PID file.
    pub fn heartbeat_writer(&self) -> HeartbeatWriter {
        HeartbeatWriter::new(self.name(), self.pid_file())
    }

    /// Remove the PID file; a missing file is fine.
    pub fn remove_pid(&self) -> Result<(), InstanceError> {
        remove_if_exists(&self.pid_file())
    }

    /// Interrupt the agent recorded in the heartbeat without waiting for it.
    pub fn stop(&self) -> Result<(), InstanceError> {
        let Some(heartbeat) = self.load_pid()? else {
            return Ok(());
        };

        let outcome = interrupt(heartbeat.pid).map_err(|source| InstanceError::Signal {
            pid: heartbeat.pid,
            source,
        })?;

        match outcome {
            Interrupt::Sent => {
                info!(instance = %self.name(), pid = heartbeat.pid, "Sent interrupt");
            }
            Interrupt::AlreadyGone => {
                remove_if_exists(&self.pid_file())?;
            }
            Interrupt::PermissionDenied => {
                warn!(
                    instance = %self.name(),
                    pid = heartbeat.pid,
                    "No permission to signal host agent, treating as still running"
                );
            }
        }
        Ok(())
    }

    /// Stop, then delete the instance directory.
    ///
    /// The protection marker is not consulted here.
    pub fn destroy(&self) -> Result<(), InstanceError> {
        self.stop()?;
        match std::fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(InstanceError::io(&self.dir, e)),
            _ => Ok(()),
        }
    }

    pub fn protect(&mut self) -> Result<(), InstanceError> {
        let marker = self.protected_marker();
        if marker.symlink_metadata().is_err() {
            ensure_dir(&self.dir).map_err(|e| InstanceError::io(&self.dir, e))?;
            write_file_mode(&marker, b"", 0o400).map_err(|e| InstanceError::io(&marker, e))?;
        }
        self.protected = true;
        Ok(())
    }

    pub fn unprotect(&mut self) -> Result<(), InstanceError> {
        remove_if_exists(&self.protected_marker())?;
        self.protected = false;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<(), InstanceError> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(InstanceError::io(path, e)),
        _ => Ok(()),
    }
}

/// Host port that reaches the guest's sshd: an explicit guest-22 forward,
/// the fixed 60022 for the `default` instance, otherwise a free loopback port.
fn ssh_local_port(spec: &VirtualMachineSpec) -> Result<u16, InstanceError> {
    if let Some(pf) = spec
        .port_forwards
        .iter()
        .find(|pf| (pf.guest_port == 22 || pf.vsock_port == 22) && pf.host_port > 0)
    {
        return Ok(pf.host_port);
    }
    if spec.name == "default" {
        return Ok(DEFAULT_SSH_LOCAL_PORT);
    }
    let listener =
        std::net::TcpListener::bind(("127.0.0.1", 0)).map_err(InstanceError::SshPort)?;
    let port = listener.local_addr().map_err(InstanceError::SshPort)?.port();
    Ok(port)
}
