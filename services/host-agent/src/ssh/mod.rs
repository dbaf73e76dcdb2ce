//! SSH access to the guest.
//!
//! The manager owns the agent's keypair, builds the canonical client option
//! set, and runs one-off commands in the guest through the system `ssh`
//! client. The guest's host key is never verified: every VM is ephemeral and
//! its identity is unknown before first boot.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use directories::BaseDirs;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::fsutil::write_file_mode;
use crate::instance::{filenames, Instance, UNIX_PATH_MAX};

mod keys;
mod options;

pub use keys::{
    discover_public_keys, ensure_keypair, is_valid_public_key, public_key_path, read_public_key,
    PubKey, USER_PRIVATE_KEY,
};
pub use options::{
    format_options, host_alias, OpenSshVersion, SshCapabilities, SshFormat, SshOption,
};

/// Errors from SSH handling.
#[derive(Debug, Error)]
pub enum SshError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("ssh-keygen failed: {0}")]
    KeyGen(String),

    #[error("socket path {path:?} is too long: >= UNIX_PATH_MAX={max}")]
    PathTooLong { path: PathBuf, max: usize },

    #[error("remote command {cmd:?} failed (exit {code:?}): {stderr}")]
    Command {
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unknown format {0:?}")]
    UnknownFormat(String),
}

impl SshError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        SshError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Name of the guest user: the same as on the host.
pub fn host_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "hearth".to_string())
}

#[cfg(unix)]
const NULL_CONFIG: &str = "/dev/null";
#[cfg(not(unix))]
const NULL_CONFIG: &str = "NUL";

/// SSH state for one instance.
#[derive(Debug, Clone)]
pub struct SshManager {
    instance: String,
    instance_dir: PathBuf,
    config_dir: PathBuf,
    personal_dir: Option<PathBuf>,
    address: String,
    port: u16,
    user: String,
    ssh: PathBuf,
    caps: Arc<SshCapabilities>,
}

impl SshManager {
    pub fn new(instance: &Instance, caps: Arc<SshCapabilities>) -> Self {
        Self {
            instance: instance.name().to_string(),
            instance_dir: instance.dir().to_path_buf(),
            config_dir: instance.dirs().config_dir(),
            personal_dir: BaseDirs::new().map(|b| b.home_dir().join(".ssh")),
            address: instance.ssh_address.clone(),
            port: instance.ssh_local_port,
            user: host_user(),
            ssh: PathBuf::from("ssh"),
            caps,
        }
    }

    /// Override where extra public keys are discovered (`~/.ssh` by default).
    pub fn with_personal_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.personal_dir = dir;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Client binary used for direct commands (`ssh` on `PATH` by default).
    pub fn with_ssh_program(mut self, ssh: impl Into<PathBuf>) -> Self {
        self.ssh = ssh.into();
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_address(&mut self, address: impl Into<String>) {
        self.address = address.into();
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.config_dir.join(USER_PRIVATE_KEY)
    }

    pub fn control_socket(&self) -> PathBuf {
        self.instance_dir.join(filenames::SSH_SOCK)
    }

    /// Ensure the agent keypair exists and return every key the guest should trust.
    ///
    /// The generated key comes first; valid keys from the personal SSH
    /// directory follow.
    pub fn load_pub_key(&self) -> Result<Vec<PubKey>, SshError> {
        let private = ensure_keypair(&self.config_dir, &format!("hearth-{}", self.instance))?;
        let mut keys = vec![read_public_key(&public_key_path(&private))?];
        if let Some(dir) = &self.personal_dir {
            keys.extend(discover_public_keys(dir));
        }
        Ok(keys)
    }

    /// Canonical option set for external `ssh` invocations.
    pub fn build_options(&self, use_extra_keys: bool) -> Result<Vec<SshOption>, SshError> {
        let control = self.control_socket();
        if control.as_os_str().len() >= UNIX_PATH_MAX {
            return Err(SshError::PathTooLong {
                path: control,
                max: UNIX_PATH_MAX,
            });
        }

        let mut opts = vec![SshOption::quoted(
            "IdentityFile",
            self.private_key_path().display(),
        )];
        if use_extra_keys {
            if let Some(dir) = &self.personal_dir {
                for key in discover_public_keys(dir) {
                    let private = key.path.with_extension("");
                    if private.exists() {
                        opts.push(SshOption::quoted("IdentityFile", private.display()));
                    }
                }
            }
        }

        opts.extend([
            SshOption::new("StrictHostKeyChecking", "no"),
            SshOption::new("UserKnownHostsFile", "/dev/null"),
            SshOption::new("NoHostAuthenticationForLocalhost", "yes"),
            SshOption::new("GSSAPIAuthentication", "no"),
            SshOption::new("PreferredAuthentications", "publickey"),
            SshOption::new("Compression", "no"),
            SshOption::new("BatchMode", "yes"),
            SshOption::new("IdentitiesOnly", "yes"),
        ]);
        if let Some(ciphers) = self.caps.cipher_preference() {
            opts.push(SshOption::quoted("Ciphers", ciphers));
        }
        opts.extend([
            SshOption::new("User", self.user.clone()),
            SshOption::new("ControlMaster", "auto"),
            SshOption::quoted("ControlPath", control.display()),
            SshOption::new("ControlPersist", "yes"),
        ]);
        Ok(opts)
    }

    /// Write the option set in `format`.
    pub fn format<W: io::Write>(
        &self,
        w: &mut W,
        format: SshFormat,
        use_extra_keys: bool,
    ) -> Result<(), SshError> {
        let opts = self.build_options(use_extra_keys)?;
        format_options(w, &self.instance, format, &opts).map_err(|e| SshError::io(Path::new("-"), e))
    }

    /// Write `<instance>/ssh.config` for use with `ssh -F`.
    pub fn write_config_file(&self) -> Result<PathBuf, SshError> {
        let mut opts = self.build_options(true)?;
        opts.push(SshOption::new("Hostname", self.address.clone()));
        opts.push(SshOption::new("Port", self.port.to_string()));

        let mut body = format!(
            "# This SSH config file can be passed to 'ssh -F'.\n\
             # It is regenerated each time the hearth instance {:?} starts.\n",
            self.instance
        )
        .into_bytes();
        let path = self.instance_dir.join(filenames::SSH_CONFIG);
        format_options(&mut body, &self.instance, SshFormat::Config, &opts)
            .map_err(|e| SshError::io(&path, e))?;

        write_file_mode(&path, &body, 0o600).map_err(|e| SshError::io(&path, e))?;
        debug!(path = %path.display(), "Wrote ssh config");
        Ok(path)
    }

    /// Run `cmd` in the guest over a fresh, non-multiplexed session.
    ///
    /// Returns standard output. No retries.
    pub async fn run_command(&self, cmd: &str) -> Result<String, SshError> {
        let identity = self.private_key_path();
        debug!(
            user = %self.user,
            address = %self.address,
            port = self.port,
            cmd = %cmd,
            "Running remote command"
        );

        let output = Command::new(&self.ssh)
            .arg("-F")
            .arg(NULL_CONFIG)
            .arg("-o")
            .arg(format!("IdentityFile={}", identity.display()))
            .args([
                "-o",
                "IdentitiesOnly=yes",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "BatchMode=yes",
                "-o",
                "PreferredAuthentications=publickey",
                "-o",
                "ControlMaster=no",
                "-o",
                "ControlPath=none",
                "-o",
                "LogLevel=ERROR",
                "-T",
            ])
            .arg("-p")
            .arg(self.port.to_string())
            .arg(format!("{}@{}", self.user, self.address))
            .arg("--")
            .arg(cmd)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| SshError::Spawn {
                program: self.ssh.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(SshError::Command {
                cmd: cmd.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Ask a lingering control master to exit. Best effort.
    pub fn exit_control_master(&self) -> Result<(), SshError> {
        let control = self.control_socket();
        if !control.exists() {
            return Ok(());
        }
        let status = std::process::Command::new(&self.ssh)
            .arg("-O")
            .arg("exit")
            .arg("-o")
            .arg(format!("ControlPath={}", control.display()))
            .arg(host_alias(&self.instance))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| SshError::Spawn {
                program: self.ssh.display().to_string(),
                source,
            })?;
        info!(instance = %self.instance, success = status.success(), "Stopped SSH control master");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_spec::{VirtualMachineSpec, VmType};
    use tempfile::TempDir;

    use crate::instance::Dirs;

    fn manager(home: &Path, caps: SshCapabilities) -> SshManager {
        let spec = VirtualMachineSpec::new("dev", VmType::Firecracker);
        let inst = Instance::new(spec, Dirs::new(home)).unwrap();
        SshManager::new(&inst, Arc::new(caps))
            .with_personal_dir(None)
            .with_user("alice")
    }

    fn value<'a>(opts: &'a [SshOption], key: &str) -> Option<&'a str> {
        opts.iter().find(|o| o.key == key).map(|o| o.value.as_str())
    }

    #[test]
    fn test_build_options() {
        let home = TempDir::new().unwrap();
        let caps = SshCapabilities {
            openssh_version: Some(OpenSshVersion::new(9, 0, 0)),
            aes_accelerated: false,
        };
        let opts = manager(home.path(), caps).build_options(false).unwrap();

        assert_eq!(opts[0].key, "IdentityFile");
        assert!(opts[0].value.contains("_config"));
        assert_eq!(value(&opts, "StrictHostKeyChecking"), Some("no"));
        assert_eq!(value(&opts, "User"), Some("alice"));
        assert_eq!(value(&opts, "ControlMaster"), Some("auto"));
        assert_eq!(
            value(&opts, "Ciphers"),
            Some("\"^chacha20-poly1305@openssh.com\"")
        );
        assert!(value(&opts, "ControlPath").unwrap().ends_with("ssh.sock\""));
    }

    #[test]
    fn test_old_client_gets_no_cipher_option() {
        let home = TempDir::new().unwrap();
        let opts = manager(home.path(), SshCapabilities::default())
            .build_options(false)
            .unwrap();
        assert_eq!(value(&opts, "Ciphers"), None);
    }

    #[test]
    fn test_control_path_too_long() {
        let home = TempDir::new().unwrap();
        let deep = home.path().join("x".repeat(UNIX_PATH_MAX));
        let err = manager(&deep, SshCapabilities::default())
            .build_options(false)
            .unwrap_err();
        assert!(matches!(err, SshError::PathTooLong { .. }));
    }

    #[test]
    fn test_write_config_file() {
        let home = TempDir::new().unwrap();
        let mut mgr = manager(home.path(), SshCapabilities::default());
        mgr.set_port(60022);
        std::fs::create_dir_all(home.path().join("dev")).unwrap();

        let path = mgr.write_config_file().unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# This SSH config file"));
        assert!(body.contains("Host hearth-dev\n"));
        assert!(body.contains("  Hostname 127.0.0.1\n"));
        assert!(body.contains("  Port 60022\n"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("ssh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_uses_direct_session() {
        let home = TempDir::new().unwrap();
        let argv = home.path().join("argv");
        let ssh = script(
            home.path(),
            &format!(
                "printf '%s\\n' \"$@\" > '{}'\necho hello from guest",
                argv.display()
            ),
        );
        let mut mgr = manager(home.path(), SshCapabilities::default()).with_ssh_program(&ssh);
        mgr.set_address("192.168.5.2".to_string());
        mgr.set_port(2222);

        let out = mgr.run_command("uname -a").await.unwrap();
        assert_eq!(out, "hello from guest\n");

        let args: Vec<String> = std::fs::read_to_string(&argv)
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        let has = |a: &str| args.iter().any(|x| x == a);
        assert!(has("ControlMaster=no"));
        assert!(has("ControlPath=none"));
        assert!(has(&format!(
            "IdentityFile={}",
            mgr.private_key_path().display()
        )));
        assert!(has("alice@192.168.5.2"));
        let port = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[port + 1], "2222");
        assert_eq!(args.last().map(String::as_str), Some("uname -a"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_reports_failure() {
        let home = TempDir::new().unwrap();
        let ssh = script(home.path(), "echo 'Permission denied' >&2\nexit 255");
        let mgr = manager(home.path(), SshCapabilities::default()).with_ssh_program(&ssh);

        match mgr.run_command("true").await {
            Err(SshError::Command { cmd, code, stderr }) => {
                assert_eq!(cmd, "true");
                assert_eq!(code, Some(255));
                assert_eq!(stderr, "Permission denied");
            }
            other => panic!("expected a command failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_command_missing_client() {
        let home = TempDir::new().unwrap();
        let mgr = manager(home.path(), SshCapabilities::default())
            .with_ssh_program(home.path().join("no-such-ssh"));
        assert!(matches!(
            mgr.run_command("true").await,
            Err(SshError::Spawn { .. })
        ));
    }
}
