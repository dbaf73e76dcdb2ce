//! Firecracker API payloads.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::instance::filenames;

/// Used when the VM leaves memory unset.
pub const DEFAULT_MEM_MIB: u32 = 1024;

/// Firecracker caps a VM at 32 vCPUs.
pub const MAX_VCPUS: u32 = 32;

/// Context ID handed to the guest's vsock device.
pub const GUEST_CID: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    pub smt: bool,
}

impl MachineConfig {
    /// From the instance's resolved sizes. Zero means "backend default".
    pub fn from_sizes(cpus: u32, memory_bytes: u64) -> Self {
        let vcpu_count = cpus.clamp(1, MAX_VCPUS) as u8;
        let mem_size_mib = match memory_bytes >> 20 {
            0 => DEFAULT_MEM_MIB,
            mib => u32::try_from(mib).unwrap_or(u32::MAX),
        };
        Self {
            vcpu_count,
            mem_size_mib,
            smt: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
}

impl BootSource {
    pub fn new(kernel_image_path: PathBuf, root: &DriveConfig) -> Self {
        let mode = if root.is_read_only { "ro" } else { "rw" };
        Self {
            kernel_image_path,
            boot_args: format!("console=ttyS0 reboot=k panic=1 pci=off root=/dev/vda {mode}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriveConfig {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

impl DriveConfig {
    pub fn root(path: PathBuf) -> Self {
        Self {
            drive_id: "rootfs".to_string(),
            path_on_host: path,
            is_root_device: true,
            is_read_only: false,
        }
    }

    /// Root drive for an instance directory: the writable disk when there is
    /// one, otherwise the base image attached read-only.
    pub fn root_for(instance_dir: &Path) -> Self {
        let diff = instance_dir.join(filenames::DIFF_DISK);
        if diff.exists() {
            return Self::root(diff);
        }
        Self {
            is_read_only: true,
            ..Self::root(instance_dir.join(filenames::BASE_DISK))
        }
    }

    /// Guest configuration disk.
    pub fn cidata(path: PathBuf) -> Self {
        Self {
            drive_id: "cidata".to_string(),
            path_on_host: path,
            is_root_device: false,
            is_read_only: true,
        }
    }

    /// An attached shared data disk.
    pub fn data(name: &str, path: PathBuf) -> Self {
        Self {
            drive_id: format!("data-{name}"),
            path_on_host: path,
            is_root_device: false,
            is_read_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VsockConfig {
    pub guest_cid: u32,
    pub uds_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_config_from_sizes() {
        assert_eq!(
            MachineConfig::from_sizes(0, 0),
            MachineConfig {
                vcpu_count: 1,
                mem_size_mib: DEFAULT_MEM_MIB,
                smt: false
            }
        );
        let cfg = MachineConfig::from_sizes(64, 2 << 30);
        assert_eq!(cfg.vcpu_count, 32);
        assert_eq!(cfg.mem_size_mib, 2048);
    }

    #[test]
    fn test_root_drive_never_writes_base_image() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(filenames::BASE_DISK), b"base").unwrap();

        let root = DriveConfig::root_for(dir.path());
        assert_eq!(root.path_on_host, dir.path().join(filenames::BASE_DISK));
        assert!(root.is_root_device);
        assert!(root.is_read_only);
        assert!(BootSource::new("/k".into(), &root).boot_args.ends_with(" ro"));

        std::fs::write(dir.path().join(filenames::DIFF_DISK), b"diff").unwrap();
        let root = DriveConfig::root_for(dir.path());
        assert_eq!(root.path_on_host, dir.path().join(filenames::DIFF_DISK));
        assert!(!root.is_read_only);
        assert!(BootSource::new("/k".into(), &root).boot_args.ends_with(" rw"));
    }

    #[test]
    fn test_drive_payload() {
        let json = serde_json::to_value(DriveConfig::cidata("/i/cidata.iso".into())).unwrap();
        assert_eq!(json["drive_id"], "cidata");
        assert_eq!(json["is_read_only"], true);
        assert_eq!(json["is_root_device"], false);

        let iface = NetworkInterface {
            iface_id: "eth0".into(),
            host_dev_name: "hth-dev".into(),
            guest_mac: None,
        };
        let json = serde_json::to_value(iface).unwrap();
        assert!(json.get("guest_mac").is_none());
    }
}
