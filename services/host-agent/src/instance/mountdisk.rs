//! Named data disks shared between instances.
//!
//! A disk lives at `<home>/_disks/<name>/datadisk`. Attachment is expressed by
//! an `in_use_by` symlink pointing at the holder's instance directory.

use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

use super::paths::{validate_name, Dirs};
use super::InstanceError;
use crate::disk::{detect_format, DiskFormat};

pub const DATA_DISK: &str = "datadisk";
pub const IN_USE_BY: &str = "in_use_by";

/// A data disk as seen on disk right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountDisk {
    pub name: String,
    pub size: u64,
    pub format: DiskFormat,
    pub dir: PathBuf,
    /// Name of the instance holding the lock.
    pub instance: Option<String>,
    pub instance_dir: Option<PathBuf>,
}

impl MountDisk {
    /// Read the current state of disk `name`.
    pub fn inspect(dirs: &Dirs, name: &str) -> Result<Self, InstanceError> {
        validate_name(name)?;
        let dir = dirs.disks_dir().join(name);
        let data = dir.join(DATA_DISK);

        let meta = match std::fs::metadata(&data) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(InstanceError::DiskNotFound(name.to_string()))
            }
            Err(e) => return Err(InstanceError::io(&data, e)),
        };
        let format = detect_format(&data).map_err(|e| InstanceError::io(&data, e))?;

        let instance_dir = read_holder(&dir.join(IN_USE_BY))?;
        let instance = instance_dir
            .as_ref()
            .and_then(|d| d.file_name())
            .map(|n| n.to_string_lossy().into_owned());

        Ok(Self {
            name: name.to_string(),
            size: meta.len(),
            format,
            dir,
            instance,
            instance_dir,
        })
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_DISK)
    }

    /// Mark the disk as used by the instance at `instance_dir`.
    pub fn lock(&mut self, instance_dir: &Path) -> Result<(), InstanceError> {
        let link = self.dir.join(IN_USE_BY);
        if let Some(holder) = read_holder(&link)? {
            return Err(InstanceError::AlreadyLocked {
                disk: self.name.clone(),
                holder,
            });
        }

        make_link(instance_dir, &link).map_err(|e| InstanceError::io(&link, e))?;
        info!(disk = %self.name, holder = %instance_dir.display(), "Locked data disk");

        self.instance_dir = Some(instance_dir.to_path_buf());
        self.instance = instance_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        Ok(())
    }

    /// Drop the attachment; unlocking an unlocked disk is a no-op.
    pub fn unlock(&mut self) -> Result<(), InstanceError> {
        let link = self.dir.join(IN_USE_BY);
        match std::fs::remove_file(&link) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                return Err(InstanceError::io(&link, e))
            }
            _ => {}
        }
        self.instance = None;
        self.instance_dir = None;
        Ok(())
    }
}

#[cfg(unix)]
fn make_link(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

// Symlinks need elevated rights on Windows; store the target as text instead.
#[cfg(not(unix))]
fn make_link(target: &Path, link: &Path) -> io::Result<()> {
    std::fs::write(link, target.to_string_lossy().as_bytes())
}

fn read_holder(link: &Path) -> Result<Option<PathBuf>, InstanceError> {
    let meta = match link.symlink_metadata() {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(InstanceError::io(link, e)),
    };
    let holder = if meta.file_type().is_symlink() {
        std::fs::read_link(link)
    } else {
        std::fs::read_to_string(link).map(|s| PathBuf::from(s.trim()))
    }
    .map_err(|e| InstanceError::io(link, e))?;
    Ok(Some(holder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_disk(dirs: &Dirs, name: &str, body: &[u8]) {
        let dir = dirs.disks_dir().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(DATA_DISK), body).unwrap();
    }

    #[test]
    fn test_inspect_missing() {
        let home = TempDir::new().unwrap();
        let dirs = Dirs::new(home.path());
        assert!(matches!(
            MountDisk::inspect(&dirs, "data"),
            Err(InstanceError::DiskNotFound(_))
        ));
    }

    #[test]
    fn test_lock_unlock() {
        let home = TempDir::new().unwrap();
        let dirs = Dirs::new(home.path());
        make_disk(&dirs, "data", &[0u8; 4096]);

        let mut disk = MountDisk::inspect(&dirs, "data").unwrap();
        assert_eq!(disk.size, 4096);
        assert_eq!(disk.format, DiskFormat::Raw);
        assert!(disk.instance.is_none());

        let holder = home.path().join("dev");
        disk.lock(&holder).unwrap();
        assert_eq!(disk.instance.as_deref(), Some("dev"));

        let seen = MountDisk::inspect(&dirs, "data").unwrap();
        assert_eq!(seen.instance_dir.as_deref(), Some(holder.as_path()));

        let mut other = seen.clone();
        assert!(matches!(
            other.lock(&home.path().join("other")),
            Err(InstanceError::AlreadyLocked { .. })
        ));

        disk.unlock().unwrap();
        disk.unlock().unwrap();
        assert!(MountDisk::inspect(&dirs, "data").unwrap().instance.is_none());
    }

    #[test]
    fn test_qcow2_detected() {
        let home = TempDir::new().unwrap();
        let dirs = Dirs::new(home.path());
        let mut body = b"QFI\xfb".to_vec();
        body.resize(1024, 0);
        make_disk(&dirs, "q", &body);

        assert_eq!(
            MountDisk::inspect(&dirs, "q").unwrap().format,
            DiskFormat::Qcow2
        );
    }
}
