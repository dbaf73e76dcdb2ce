//! Home directory layout and instance naming.

use std::path::{Path, PathBuf};

use directories::BaseDirs;

use super::InstanceError;

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "HEARTH_HOME";

/// Longest accepted instance name.
pub const MAX_NAME_LEN: usize = 76;

/// Maximum length of a Unix socket path, including the trailing NUL.
#[cfg(target_os = "macos")]
pub const UNIX_PATH_MAX: usize = 104;
#[cfg(not(target_os = "macos"))]
pub const UNIX_PATH_MAX: usize = 108;

/// Per-instance file names.
pub mod filenames {
    pub const PID_FILE: &str = "hostagent.pid";
    pub const PROTECTED: &str = "protected";
    pub const BASE_DISK: &str = "basedisk";
    pub const DIFF_DISK: &str = "diffdisk";
    pub const CIDATA_ISO: &str = "cidata.iso";
    pub const CIDATA_DIR: &str = "cidata";
    pub const SSH_CONFIG: &str = "ssh.config";
    pub const SSH_SOCK: &str = "ssh.sock";
    pub const VNC_PASSWORD: &str = "vncpassword";
    pub const VNC_DISPLAY: &str = "vncdisplay";
    pub const GUEST_BIN_DIR: &str = "bin";
    pub const SERIAL_LOG: &str = "serial.log";
    pub const FC_SOCK: &str = "fc.sock";
    pub const VSOCK_SOCK: &str = "vsock.sock";
    pub const WSL_DISTRO_DIR: &str = "distro";
}

/// Root of all on-disk state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirs {
    root: PathBuf,
}

impl Dirs {
    /// Use an explicit root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$HEARTH_HOME`, or `~/.hearth`.
    pub fn from_env() -> Result<Self, InstanceError> {
        if let Some(root) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(root));
        }
        let base = BaseDirs::new().ok_or(InstanceError::NoHomeDir)?;
        Ok(Self::new(base.home_dir().join(".hearth")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// SSH keys shared by every instance.
    pub fn config_dir(&self) -> PathBuf {
        self.root.join("_config")
    }

    /// Named data disks.
    pub fn disks_dir(&self) -> PathBuf {
        self.root.join("_disks")
    }

    /// Download cache.
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("_cache")
    }

    /// Directory of instance `name`; fails for names that are not safe path components.
    pub fn instance_dir(&self, name: &str) -> Result<PathBuf, InstanceError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

/// Fixed control socket location for instance `name`.
pub fn control_socket_path(name: &str) -> PathBuf {
    // $TMPDIR on macOS is too deep for sun_path.
    let base = if cfg!(unix) {
        PathBuf::from("/tmp")
    } else {
        std::env::temp_dir()
    };
    base.join(format!("hearth-{name}.sock"))
}

/// Accept `[A-Za-z0-9]+([._-][A-Za-z0-9]+)*` up to [`MAX_NAME_LEN`] bytes.
pub fn validate_name(name: &str) -> Result<(), InstanceError> {
    let invalid = |reason: &'static str| InstanceError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("too long"));
    }

    let mut prev_sep = true;
    for c in name.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' => prev_sep = false,
            '.' | '_' | '-' => {
                if prev_sep {
                    return Err(invalid("separators must sit between alphanumerics"));
                }
                prev_sep = true;
            }
            _ => return Err(invalid("only [A-Za-z0-9._-] are allowed")),
        }
    }
    if prev_sep {
        return Err(invalid("separators must sit between alphanumerics"));
    }
    Ok(())
}
