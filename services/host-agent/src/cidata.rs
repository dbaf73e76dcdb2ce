//! Guest configuration disk.
//!
//! The guest boots with a NoCloud data source labelled `cidata`: `meta-data`,
//! `user-data`, `network-config`, plus the guest agent binary. Cloud-init
//! reads YAML, and every document here is emitted as JSON, which YAML
//! accepts.
//!
//! Backends that cannot attach media (WSL2) get the same files as a plain
//! `cidata/` directory with an extra `ssh_authorized_keys`.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use hearth_spec::VmType;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::driver::guest_link;
use crate::fsutil::{ensure_dir, write_file_mode};
use crate::instance::{filenames, Instance};
use crate::ssh::PubKey;

/// File name of the guest agent inside the configuration disk.
pub const GUEST_AGENT_BINARY: &str = "hearth-guestagent";

/// Volume label cloud-init looks for.
pub const VOLUME_LABEL: &str = "cidata";

const GUEST_UID: u32 = 1000;

#[derive(Debug, Error)]
pub enum CidataError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("guest user must not be root")]
    RootUser,

    #[error("no SSH public keys available for the guest")]
    NoKeys,

    #[error("guest agent binary missing at {0}")]
    MissingGuestBinary(PathBuf),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed: {stderr}")]
    Iso { program: String, stderr: String },
}

impl CidataError {
    fn io(path: &Path, source: io::Error) -> Self {
        CidataError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Where the guest binary is staged before it goes into the disk.
pub fn guest_binary_path(instance: &Instance) -> PathBuf {
    let spec = instance.spec();
    let os = if spec.os.is_empty() {
        "linux".to_string()
    } else {
        spec.os.to_lowercase()
    };
    instance
        .file(filenames::GUEST_BIN_DIR)
        .join(format!("{GUEST_AGENT_BINARY}.{os}.{}", spec.arch.as_str()))
}

/// Turns a staging directory into an ISO 9660 image.
#[async_trait]
pub trait IsoWriter: Send + Sync {
    async fn write_iso(&self, src: &Path, iso: &Path, label: &str) -> Result<(), CidataError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoTool {
    Xorriso,
    Mkisofs,
    Hdiutil,
}

/// [`IsoWriter`] that shells out to an installed mastering tool.
#[derive(Debug, Clone)]
pub struct ExternalIsoWriter {
    tool: IsoTool,
    program: PathBuf,
}

impl ExternalIsoWriter {
    pub fn new(tool: IsoTool, program: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            program: program.into(),
        }
    }

    fn args(&self, src: &Path, iso: &Path, label: &str) -> Vec<std::ffi::OsString> {
        let mut args: Vec<std::ffi::OsString> = Vec::new();
        match self.tool {
            IsoTool::Xorriso | IsoTool::Mkisofs => {
                if self.tool == IsoTool::Xorriso {
                    args.extend(["-as".into(), "mkisofs".into()]);
                }
                args.extend(["-output".into(), iso.into()]);
                args.extend(["-volid".into(), label.into()]);
                args.extend(["-joliet".into(), "-rock".into()]);
                args.push(src.into());
            }
            IsoTool::Hdiutil => {
                args.extend(["makehybrid".into(), "-iso".into(), "-joliet".into()]);
                args.extend(["-default-volume-name".into(), label.into()]);
                args.extend(["-o".into(), iso.into()]);
                args.push(src.into());
            }
        }
        args
    }
}

impl Default for ExternalIsoWriter {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            Self::new(IsoTool::Hdiutil, "hdiutil")
        } else {
            Self::new(IsoTool::Xorriso, "xorriso")
        }
    }
}

#[async_trait]
impl IsoWriter for ExternalIsoWriter {
    async fn write_iso(&self, src: &Path, iso: &Path, label: &str) -> Result<(), CidataError> {
        let program = self.program.display().to_string();
        let output = Command::new(&self.program)
            .args(self.args(src, iso, label))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| CidataError::Spawn {
                program: program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(CidataError::Iso {
                program,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Builds the configuration disk for one instance.
pub struct CloudInit {
    writer: Arc<dyn IsoWriter>,
}

impl CloudInit {
    pub fn new(writer: Arc<dyn IsoWriter>) -> Self {
        Self { writer }
    }

    /// Write `cidata.iso` (or `cidata/`) for `instance`, replacing any
    /// previous one. Returns the path written.
    pub async fn create_boot_disk(
        &self,
        instance: &Instance,
        user: &str,
        keys: &[PubKey],
    ) -> Result<PathBuf, CidataError> {
        if user == "root" {
            return Err(CidataError::RootUser);
        }
        if keys.is_empty() {
            return Err(CidataError::NoKeys);
        }
        let binary = guest_binary_path(instance);
        if !binary.is_file() {
            return Err(CidataError::MissingGuestBinary(binary));
        }

        let keys: Vec<&str> = keys.iter().map(|k| k.content.trim()).collect();
        let mut layout = vec![
            ("meta-data", meta_data(instance)),
            ("user-data", user_data(instance, user, &keys)),
            ("network-config", network_config(instance)),
        ];

        let vm_type = instance.spec().vm_type;
        if vm_type.wants_cidata_dir() {
            layout.push(("ssh_authorized_keys", keys.join("\n")));
            let dir = instance.file(filenames::CIDATA_DIR);
            stage(&dir, &layout, &binary)?;
            info!(instance = %instance.name(), path = %dir.display(), "Wrote cidata directory");
            return Ok(dir);
        }

        let staging = instance.file(".cidata-staging");
        stage(&staging, &layout, &binary)?;

        let iso = instance.file(filenames::CIDATA_ISO);
        remove_path(&iso)?;
        let result = self.writer.write_iso(&staging, &iso, VOLUME_LABEL).await;
        remove_path(&staging)?;
        result?;

        info!(instance = %instance.name(), path = %iso.display(), "Wrote cidata ISO");
        Ok(iso)
    }
}

fn stage(dir: &Path, layout: &[(&str, String)], binary: &Path) -> Result<(), CidataError> {
    remove_path(dir)?;
    ensure_dir(dir).map_err(|e| CidataError::io(dir, e))?;
    for (name, body) in layout {
        let path = dir.join(name);
        write_file_mode(&path, body.as_bytes(), 0o600).map_err(|e| CidataError::io(&path, e))?;
    }
    let dest = dir.join(GUEST_AGENT_BINARY);
    std::fs::copy(binary, &dest).map_err(|e| CidataError::io(&dest, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| CidataError::io(&dest, e))?;
    }
    debug!(dir = %dir.display(), files = layout.len() + 1, "Staged cidata");
    Ok(())
}

fn remove_path(path: &Path) -> Result<(), CidataError> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(CidataError::io(path, e)),
        _ => Ok(()),
    }
}

fn meta_data(instance: &Instance) -> String {
    // A fresh instance-id makes cloud-init re-apply network config on every boot.
    let iid = format!("iid-{}", chrono::Utc::now().timestamp());
    json!({
        "instance-id": iid,
        "local-hostname": instance.name(),
    })
    .to_string()
}

fn user_data(instance: &Instance, user: &str, keys: &[&str]) -> String {
    let mount = "/mnt/cidata";
    let start_agent = format!(
        "mkdir -p {mount} && (mountpoint -q {mount} || mount -o ro LABEL={VOLUME_LABEL} {mount}) \
         && install -m 0755 {mount}/{GUEST_AGENT_BINARY} /usr/local/bin/{GUEST_AGENT_BINARY} \
         && (/usr/local/bin/{GUEST_AGENT_BINARY} --cidata {mount} >/var/log/{GUEST_AGENT_BINARY}.log 2>&1 &)"
    );
    let config = json!({
        "hostname": instance.name(),
        "users": [{
            "name": user,
            "uid": GUEST_UID,
            "homedir": format!("/home/{user}"),
            "shell": "/bin/bash",
            "sudo": "ALL=(ALL) NOPASSWD:ALL",
            "lock_passwd": true,
            "ssh_authorized_keys": keys,
        }],
        "runcmd": [["/bin/sh", "-c", start_agent]],
    });
    format!("#cloud-config\n{config:#}\n")
}

fn network_config(instance: &Instance) -> String {
    let spec = instance.spec();
    let mut ethernets = Map::new();
    for (index, network) in spec.networks.iter().enumerate() {
        let iface = if network.interface.is_empty() {
            format!("eth{index}")
        } else {
            network.interface.clone()
        };
        let mut entry = Map::new();
        if !network.mac_address.is_empty() {
            entry.insert(
                "match".to_string(),
                json!({ "macaddress": network.mac_address }),
            );
            entry.insert("set-name".to_string(), json!(iface));
        }
        match spec.vm_type {
            VmType::Wsl2 => {
                entry.insert("dhcp4".to_string(), json!(true));
            }
            VmType::Firecracker => {
                let link = guest_link(instance.name(), index);
                entry.insert("addresses".to_string(), json!([link.guest_cidr()]));
                if index == 0 {
                    entry.insert(
                        "routes".to_string(),
                        json!([{ "to": "default", "via": link.host.to_string() }]),
                    );
                }
            }
        }
        ethernets.insert(iface, Value::Object(entry));
    }
    json!({ "version": 2, "ethernets": ethernets }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use hearth_spec::VirtualMachineSpec;
    use tempfile::TempDir;

    use crate::instance::Dirs;

    /// Records the staged files instead of mastering an image.
    #[derive(Default)]
    struct RecordingWriter {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl IsoWriter for RecordingWriter {
        async fn write_iso(&self, src: &Path, iso: &Path, label: &str) -> Result<(), CidataError> {
            assert_eq!(label, VOLUME_LABEL);
            let mut names: Vec<String> = std::fs::read_dir(src)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            *self.seen.lock().unwrap() = names;
            std::fs::write(iso, b"iso").unwrap();
            Ok(())
        }
    }

    fn instance(home: &Path, vm_type: VmType) -> Instance {
        let inst = Instance::new(VirtualMachineSpec::new("dev", vm_type), Dirs::new(home)).unwrap();
        let bin = guest_binary_path(&inst);
        std::fs::create_dir_all(bin.parent().unwrap()).unwrap();
        std::fs::write(&bin, b"\x7fELF").unwrap();
        inst
    }

    fn key() -> PubKey {
        PubKey {
            content: "ssh-ed25519 AAAA dev@host\n".to_string(),
            path: PathBuf::from("user.pub"),
        }
    }

    #[tokio::test]
    async fn test_iso_for_firecracker() {
        let home = TempDir::new().unwrap();
        let inst = instance(home.path(), VmType::Firecracker);
        let writer = Arc::new(RecordingWriter::default());

        let path = CloudInit::new(writer.clone())
            .create_boot_disk(&inst, "alice", &[key()])
            .await
            .unwrap();

        assert_eq!(path, inst.file(filenames::CIDATA_ISO));
        assert!(path.exists());
        assert!(!inst.file(".cidata-staging").exists());
        assert_eq!(
            *writer.seen.lock().unwrap(),
            vec![GUEST_AGENT_BINARY, "meta-data", "network-config", "user-data"]
        );
    }

    #[tokio::test]
    async fn test_directory_for_wsl2() {
        let home = TempDir::new().unwrap();
        let inst = instance(home.path(), VmType::Wsl2);

        let path = CloudInit::new(Arc::new(RecordingWriter::default()))
            .create_boot_disk(&inst, "alice", &[key()])
            .await
            .unwrap();

        assert_eq!(path, inst.file(filenames::CIDATA_DIR));
        let keys = std::fs::read_to_string(path.join("ssh_authorized_keys")).unwrap();
        assert_eq!(keys, "ssh-ed25519 AAAA dev@host");
        let network = std::fs::read_to_string(path.join("network-config")).unwrap();
        let network: Value = serde_json::from_str(&network).unwrap();
        assert_eq!(network["ethernets"]["eth0"]["dhcp4"], json!(true));
    }

    #[tokio::test]
    async fn test_rejects_root_and_missing_keys() {
        let home = TempDir::new().unwrap();
        let inst = instance(home.path(), VmType::Firecracker);
        let ci = CloudInit::new(Arc::new(RecordingWriter::default()));

        let err = ci.create_boot_disk(&inst, "root", &[key()]).await.unwrap_err();
        assert!(matches!(err, CidataError::RootUser));
        let err = ci.create_boot_disk(&inst, "alice", &[]).await.unwrap_err();
        assert!(matches!(err, CidataError::NoKeys));
    }

    #[test]
    fn test_static_network_uses_guest_link() {
        let home = TempDir::new().unwrap();
        let inst = instance(home.path(), VmType::Firecracker);
        let network: Value = serde_json::from_str(&network_config(&inst)).unwrap();
        let link = guest_link("dev", 0);

        let eth0 = &network["ethernets"]["eth0"];
        assert_eq!(eth0["addresses"], json!([link.guest_cidr()]));
        assert_eq!(eth0["routes"][0]["via"], json!(link.host.to_string()));
        assert_eq!(
            eth0["match"]["macaddress"],
            json!(inst.spec().networks[0].mac_address)
        );
    }

    #[test]
    fn test_user_data_is_cloud_config() {
        let home = TempDir::new().unwrap();
        let inst = instance(home.path(), VmType::Firecracker);
        let body = user_data(&inst, "alice", &["ssh-ed25519 AAAA"]);
        let (header, doc) = body.split_once('\n').unwrap();
        assert_eq!(header, "#cloud-config");
        let doc: Value = serde_json::from_str(doc).unwrap();
        assert_eq!(doc["users"][0]["name"], json!("alice"));
        assert_eq!(doc["users"][0]["ssh_authorized_keys"], json!(["ssh-ed25519 AAAA"]));
    }

    #[test]
    fn test_external_tool_arguments() {
        let args = ExternalIsoWriter::new(IsoTool::Xorriso, "xorriso").args(
            Path::new("/s"),
            Path::new("/o.iso"),
            "cidata",
        );
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            ["-as", "mkisofs", "-output", "/o.iso", "-volid", "cidata", "-joliet", "-rock", "/s"]
        );
    }
}
