//! Hypervisor backends.
//!
//! The orchestrator only sees [`Driver`]; one implementation exists per
//! [`VmType`], plus [`MockDriver`] for tests.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use hearth_networking::GuestLink;
use hearth_spec::VmType;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::forward::{BoxedStream, GuestDialer};
use crate::instance::{Instance, InstanceError};

#[cfg(unix)]
mod firecracker;
mod mock;
mod wsl2;

#[cfg(unix)]
pub use firecracker::{tap_name, FirecrackerDriver, HybridVsockDialer};
pub use mock::MockDriver;
pub use wsl2::{decode_wsl_output, Wsl2Driver};

/// Guest-channel port the guest agent listens on.
pub const GUEST_AGENT_PORT: u32 = 10443;

/// Link addressing for network `index` of `instance`.
pub fn guest_link(instance: &str, index: usize) -> GuestLink {
    if index == 0 {
        GuestLink::for_seed(instance)
    } else {
        GuestLink::for_seed(&format!("{instance}#{index}"))
    }
}

/// Errors a backend returns synchronously.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed: {stderr}")]
    Command { program: String, stderr: String },

    #[error("Firecracker API: {0}")]
    Api(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error("guest connection failed: {0}")]
    Connect(#[source] io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("backend is not running")]
    NotRunning,

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    #[error("invalid backend configuration: {0}")]
    Config(String),
}

impl DriverError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        DriverError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Asynchronous backend failures, delivered after a successful start.
pub type ErrorChannel = mpsc::Receiver<anyhow::Error>;

/// Capability contract between the orchestrator and a hypervisor backend.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Boot the guest. Later failures (e.g. the VMM exiting) arrive on the
    /// returned channel.
    async fn start(&self, cancel: CancellationToken) -> Result<ErrorChannel, DriverError>;

    async fn stop(&self) -> Result<(), DriverError>;

    /// Dialer for guest-channel forwards.
    async fn dialer(&self) -> Result<Arc<dyn GuestDialer>, DriverError>;

    /// A fresh connection to the guest agent.
    async fn guest_connection(&self) -> Result<BoxedStream, DriverError>;

    /// Whether [`Driver::run_gui`] must own the calling thread.
    fn can_run_gui(&self) -> bool {
        false
    }

    fn run_gui(&self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("GUI"))
    }

    async fn change_display_password(&self, _password: &str) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("display password"))
    }

    async fn get_display_connection(&self) -> Result<String, DriverError> {
        Err(DriverError::Unsupported("display connection"))
    }

    /// Address SSH should use, when the backend learns it only after start.
    fn ssh_address(&self) -> Option<String> {
        None
    }
}

/// Host-side settings shared by the backends.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub firecracker_bin: PathBuf,
    pub kernel: Option<PathBuf>,
    pub wsl_exe: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            firecracker_bin: PathBuf::from("firecracker"),
            kernel: None,
            wsl_exe: PathBuf::from("wsl.exe"),
        }
    }
}

/// Backend for `instance.spec().vm_type`.
pub fn new_driver(
    instance: &Instance,
    config: &DriverConfig,
) -> Result<Arc<dyn Driver>, DriverError> {
    match instance.spec().vm_type {
        #[cfg(unix)]
        VmType::Firecracker => Ok(Arc::new(FirecrackerDriver::new(instance, config))),
        #[cfg(not(unix))]
        VmType::Firecracker => Err(DriverError::Unsupported("firecracker on this host")),
        VmType::Wsl2 => Ok(Arc::new(Wsl2Driver::new(instance, config))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_spec::VirtualMachineSpec;
    use tempfile::TempDir;

    use crate::instance::Dirs;

    #[test]
    fn test_guest_links_differ_per_index() {
        assert_eq!(guest_link("dev", 0), GuestLink::for_seed("dev"));
        assert_eq!(guest_link("dev", 1), GuestLink::for_seed("dev#1"));
        assert_ne!(guest_link("dev", 0), guest_link("dev", 1));
    }

    #[cfg(unix)]
    #[test]
    fn test_driver_selection() {
        let home = TempDir::new().unwrap();
        for (vm_type, name) in [(VmType::Firecracker, "firecracker"), (VmType::Wsl2, "wsl2")] {
            let spec = VirtualMachineSpec::new("dev", vm_type);
            let inst = Instance::new(spec, Dirs::new(home.path())).unwrap();
            let driver = new_driver(&inst, &DriverConfig::default()).unwrap();
            assert_eq!(driver.name(), name);
            assert!(!driver.can_run_gui());
        }
    }
}
