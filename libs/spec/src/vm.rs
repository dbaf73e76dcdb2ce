//! The virtual machine specification.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::SpecError;

/// Feature flag enabling node-group port mapping on the host gateway.
pub const FEATURE_NODE_GROUPS: &str = "NodeGroups";

/// Backend variant driving the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    /// Hardware virtualization through Firecracker.
    Firecracker,
    /// Lightweight Linux subsystem on Windows hosts.
    Wsl2,
}

impl VmType {
    /// Backends that size the guest themselves ignore cpu/memory/disk.
    pub fn manages_own_resources(self) -> bool {
        matches!(self, VmType::Wsl2)
    }

    /// Whether the guest configuration is handed over as a directory instead of an ISO.
    pub fn wants_cidata_dir(self) -> bool {
        matches!(self, VmType::Wsl2)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmType::Firecracker => "firecracker",
            VmType::Wsl2 => "wsl2",
        }
    }
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmType {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "firecracker" => Ok(VmType::Firecracker),
            "wsl2" => Ok(VmType::Wsl2),
            other => Err(SpecError::UnknownVmType(other.to_string())),
        }
    }
}

/// CPU architecture of the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    #[serde(alias = "amd64")]
    X86_64,
    #[serde(alias = "arm64")]
    Aarch64,
}

impl Arch {
    /// Architecture of the running host.
    pub fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else {
            Arch::X86_64
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }
}

impl Default for Arch {
    fn default() -> Self {
        Arch::host()
    }
}

/// A file fetched from a remote location, optionally pinned by digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    /// `https://`, `http://`, `file://` URL or a plain local path.
    pub location: String,
    #[serde(default)]
    pub arch: Arch,
    /// `sha256:<hex>`; empty skips verification.
    #[serde(default)]
    pub digest: String,
}

/// Base image candidates, one per architecture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub images: Vec<RemoteFile>,
}

/// Pick the first entry matching `arch`.
pub fn select_for_arch(files: &[RemoteFile], arch: Arch) -> Option<&RemoteFile> {
    files.iter().find(|f| f.arch == arch)
}

/// A guest network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub mac_address: String,
}

/// Display configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    /// `none`, `default` or `vnc`.
    #[serde(default)]
    pub display: String,
    #[serde(default)]
    pub vnc: VncOptions,
}

impl Video {
    pub fn wants_vnc(&self) -> bool {
        self.display == "vnc"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VncOptions {
    /// `host:display[,option...]`, e.g. `127.0.0.1:0,to=9`.
    #[serde(default)]
    pub display: Option<String>,
}

/// A host → guest forward declared by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    /// `tcp` when empty.
    #[serde(default)]
    pub proto: String,
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub host_port: u16,
    #[serde(default)]
    pub host_socket: String,
    #[serde(default)]
    pub guest_ip: String,
    #[serde(default)]
    pub guest_port: u16,
    #[serde(default)]
    pub guest_socket: String,
    /// When non-zero the destination is this guest-channel port.
    #[serde(default)]
    pub vsock_port: u32,
}

/// Ports the host exposes for the node running inside the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPoint {
    #[serde(default)]
    pub api_port: u16,
    #[serde(default)]
    pub tunnel_port: u16,
}

/// Complete description of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    pub name: String,
    /// Stable identity, used to derive MAC addresses.
    #[serde(default)]
    pub uid: String,
    pub vm_type: VmType,
    #[serde(default = "default_os")]
    pub os: String,
    #[serde(default)]
    pub arch: Arch,
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub disk: String,
    #[serde(default)]
    pub image: ImageRef,
    #[serde(default)]
    pub guest_binaries: Vec<RemoteFile>,
    /// Names of data disks under the shared disk directory to attach.
    #[serde(default)]
    pub additional_disks: Vec<String>,
    #[serde(default)]
    pub networks: Vec<Network>,
    #[serde(default)]
    pub video: Video,
    #[serde(default)]
    pub port_forwards: Vec<PortForward>,
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
    #[serde(default)]
    pub access_point: AccessPoint,
}

fn default_os() -> String {
    "linux".to_string()
}

impl VirtualMachineSpec {
    /// Minimal spec, mostly useful for tests.
    pub fn new(name: impl Into<String>, vm_type: VmType) -> Self {
        Self {
            name: name.into(),
            uid: String::new(),
            vm_type,
            os: default_os(),
            arch: Arch::host(),
            cpus: 0,
            memory: String::new(),
            disk: String::new(),
            image: ImageRef::default(),
            guest_binaries: Vec::new(),
            additional_disks: Vec::new(),
            networks: Vec::new(),
            video: Video::default(),
            port_forwards: Vec::new(),
            features: BTreeMap::new(),
            access_point: AccessPoint::default(),
        }
    }

    /// Decode from JSON.
    pub fn from_json(bytes: &[u8]) -> Result<Self, SpecError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// A flag counts as enabled only when present and `true`.
    pub fn has_feature(&self, name: &str) -> bool {
        self.features.get(name).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_full_spec() {
        let json = br#"{
            "name": "dev",
            "vmType": "firecracker",
            "arch": "arm64",
            "cpus": 2,
            "memory": "2GiB",
            "disk": "20GiB",
            "image": {"images": [{"location": "https://example.com/img.raw", "arch": "aarch64"}]},
            "video": {"display": "vnc", "vnc": {"display": ":1"}},
            "portForwards": [{"hostPort": 2222, "vsockPort": 22}],
            "features": {"NodeGroups": true},
            "accessPoint": {"apiPort": 6443, "tunnelPort": 8132}
        }"#;

        let spec = VirtualMachineSpec::from_json(json).unwrap();
        assert_eq!(spec.vm_type, VmType::Firecracker);
        assert_eq!(spec.arch, Arch::Aarch64);
        assert_eq!(spec.os, "linux");
        assert!(spec.video.wants_vnc());
        assert_eq!(spec.port_forwards[0].vsock_port, 22);
        assert!(spec.has_feature(FEATURE_NODE_GROUPS));
        assert_eq!(spec.access_point.tunnel_port, 8132);
        assert!(select_for_arch(&spec.image.images, Arch::Aarch64).is_some());
        assert!(select_for_arch(&spec.image.images, Arch::X86_64).is_none());
    }

    #[test]
    fn test_feature_flags() {
        let mut spec = VirtualMachineSpec::new("dev", VmType::Wsl2);
        assert!(!spec.has_feature(FEATURE_NODE_GROUPS));

        spec.features.insert(FEATURE_NODE_GROUPS.to_string(), false);
        assert!(!spec.has_feature(FEATURE_NODE_GROUPS));

        spec.features.insert(FEATURE_NODE_GROUPS.to_string(), true);
        assert!(spec.has_feature(FEATURE_NODE_GROUPS));
    }

    #[test]
    fn test_vm_type_parse() {
        assert_eq!("WSL2".parse::<VmType>().unwrap(), VmType::Wsl2);
        assert!("qemu".parse::<VmType>().is_err());
        assert!(VmType::Wsl2.manages_own_resources());
        assert!(!VmType::Firecracker.manages_own_resources());
    }
}
