//! Disk provisioning.
//!
//! [`DiskProvisioner::ensure_disk`] stages the base image and derives the
//! per-instance writable disk from it. It is safe to call on every start: an
//! existing writable disk is never touched again.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hearth_spec::{parse_ram_size, select_for_arch, SpecError};
use thiserror::Error;
use tracing::{debug, info};

use crate::download::{DownloadError, Downloader};
use crate::fsutil::ensure_dir;
use crate::instance::{filenames, Instance};

mod convert;
mod format;

pub use convert::{ImageConverter, QemuImgConverter};
pub use format::{detect_format, DiskFormat};

/// Errors from disk provisioning.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("no base image for architecture {0}")]
    NoImage(&'static str),

    #[error("disk size: {0}")]
    Size(#[from] SpecError),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed: {stderr}")]
    Convert { program: String, stderr: String },
}

impl DiskError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        DiskError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What [`DiskProvisioner::ensure_disk`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// The writable disk was already there.
    AlreadyExists,
    /// No disk size was declared; only the base image was staged.
    BaseOnly,
    /// Base is installable media; an empty sparse data disk was allocated.
    SparseDataDisk,
    /// Base image was converted and resized into the writable disk.
    Converted,
}

pub struct DiskProvisioner {
    downloader: Downloader,
    converter: Arc<dyn ImageConverter>,
}

impl DiskProvisioner {
    pub fn new(downloader: Downloader, converter: Arc<dyn ImageConverter>) -> Self {
        Self {
            downloader,
            converter,
        }
    }

    /// Make sure `instance` has its writable disk.
    pub async fn ensure_disk(&self, instance: &Instance) -> Result<Provisioned, DiskError> {
        let diff = instance.file(filenames::DIFF_DISK);
        match std::fs::metadata(&diff) {
            Ok(_) => {
                debug!(path = %diff.display(), "Writable disk already exists");
                return Ok(Provisioned::AlreadyExists);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(DiskError::io(&diff, e)),
        }

        ensure_dir(instance.dir()).map_err(|e| DiskError::io(instance.dir(), e))?;

        let base = instance.file(filenames::BASE_DISK);
        let spec = instance.spec();
        let image = select_for_arch(&spec.image.images, spec.arch)
            .ok_or(DiskError::NoImage(spec.arch.as_str()))?;
        self.downloader.fetch(image, &base).await?;

        // The declared size, even for backends that report zero resources.
        let size = parse_ram_size(&spec.disk)?;
        if size == 0 {
            info!(instance = %instance.name(), "No disk size declared, skipping writable disk");
            return Ok(Provisioned::BaseOnly);
        }

        let format = detect_format(&base).map_err(|e| DiskError::io(&base, e))?;
        let staging = diff.with_extension("tmp");
        let outcome = if format == DiskFormat::Iso {
            let file = std::fs::File::create(&staging).map_err(|e| DiskError::io(&staging, e))?;
            file.set_len(size).map_err(|e| DiskError::io(&staging, e))?;
            Provisioned::SparseDataDisk
        } else {
            if let Err(e) = self.converter.convert(&base, &staging, size).await {
                std::fs::remove_file(&staging).ok();
                return Err(e);
            }
            Provisioned::Converted
        };
        std::fs::rename(&staging, &diff).map_err(|e| DiskError::io(&diff, e))?;

        info!(
            instance = %instance.name(),
            base_format = %format,
            size,
            outcome = ?outcome,
            "Provisioned writable disk"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use hearth_spec::{RemoteFile, VirtualMachineSpec, VmType};
    use tempfile::TempDir;

    use crate::instance::{Dirs, Phase};

    #[derive(Default)]
    struct CountingConverter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageConverter for CountingConverter {
        async fn convert(&self, src: &Path, dst: &Path, size: u64) -> Result<(), DiskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            QemuImgConverter::default().convert(src, dst, size).await
        }
    }

    fn instance(home: &Path, base: &Path, disk: &str) -> Instance {
        instance_of(VmType::Firecracker, home, base, disk)
    }

    fn instance_of(vm_type: VmType, home: &Path, base: &Path, disk: &str) -> Instance {
        let mut spec = VirtualMachineSpec::new("dev", vm_type);
        spec.disk = disk.to_string();
        spec.image.images.push(RemoteFile {
            location: base.display().to_string(),
            arch: spec.arch,
            digest: String::new(),
        });
        Instance::new(spec, Dirs::new(home)).unwrap()
    }

    #[tokio::test]
    async fn test_ensure_disk_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("image.raw");
        std::fs::write(&base, b"raw image").unwrap();
        let inst = instance(&tmp.path().join("home"), &base, "1MiB");

        let converter = Arc::new(CountingConverter::default());
        let provisioner =
            DiskProvisioner::new(Downloader::new(None).unwrap(), converter.clone());

        assert_eq!(
            provisioner.ensure_disk(&inst).await.unwrap(),
            Provisioned::Converted
        );
        let diff = inst.file(filenames::DIFF_DISK);
        let first = std::fs::metadata(&diff).unwrap();
        assert_eq!(first.len(), 1 << 20);

        assert_eq!(
            provisioner.ensure_disk(&inst).await.unwrap(),
            Provisioned::AlreadyExists
        );
        let second = std::fs::metadata(&diff).unwrap();
        assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.modified().unwrap(), second.modified().unwrap());
        assert_eq!(std::fs::read(&base).unwrap(), b"raw image");
    }

    #[tokio::test]
    async fn test_iso_gets_sparse_data_disk() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("installer.iso");
        let mut body = vec![0u8; 40 * 1024];
        body[32769..32774].copy_from_slice(b"CD001");
        std::fs::write(&base, body).unwrap();
        let inst = instance(&tmp.path().join("home"), &base, "8MiB");

        let converter = Arc::new(CountingConverter::default());
        let provisioner =
            DiskProvisioner::new(Downloader::new(None).unwrap(), converter.clone());

        assert_eq!(
            provisioner.ensure_disk(&inst).await.unwrap(),
            Provisioned::SparseDataDisk
        );
        assert_eq!(converter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            std::fs::metadata(inst.file(filenames::DIFF_DISK)).unwrap().len(),
            8 << 20
        );
    }

    #[tokio::test]
    async fn test_zero_size_stages_base_only() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("image.raw");
        std::fs::write(&base, b"raw image").unwrap();
        let inst = instance(&tmp.path().join("home"), &base, "");

        let provisioner = DiskProvisioner::new(
            Downloader::new(None).unwrap(),
            Arc::new(CountingConverter::default()),
        );
        assert_eq!(
            provisioner.ensure_disk(&inst).await.unwrap(),
            Provisioned::BaseOnly
        );
        assert!(inst.file(filenames::BASE_DISK).exists());
        assert!(!inst.file(filenames::DIFF_DISK).exists());

        let mut inst = inst;
        inst.inspect();
        assert_eq!(inst.status.phase, Phase::Stopped);
    }

    #[tokio::test]
    async fn test_wsl2_disk_uses_declared_size() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("rootfs.raw");
        std::fs::write(&base, b"rootfs").unwrap();
        let mut inst = instance_of(VmType::Wsl2, &tmp.path().join("home"), &base, "1MiB");
        assert_eq!(inst.disk_bytes, 0);

        let provisioner = DiskProvisioner::new(
            Downloader::new(None).unwrap(),
            Arc::new(CountingConverter::default()),
        );
        assert_eq!(
            provisioner.ensure_disk(&inst).await.unwrap(),
            Provisioned::Converted
        );
        assert_eq!(
            std::fs::metadata(inst.file(filenames::DIFF_DISK)).unwrap().len(),
            1 << 20
        );

        inst.inspect();
        assert_eq!(inst.status.phase, Phase::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_declared_size() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("image.raw");
        std::fs::write(&base, b"raw image").unwrap();
        // WSL2 instances do not parse sizes up front.
        let inst = instance_of(VmType::Wsl2, &tmp.path().join("home"), &base, "lots");

        let provisioner = DiskProvisioner::new(
            Downloader::new(None).unwrap(),
            Arc::new(CountingConverter::default()),
        );
        assert!(matches!(
            provisioner.ensure_disk(&inst).await,
            Err(DiskError::Size(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_image_for_arch() {
        let tmp = TempDir::new().unwrap();
        let spec = VirtualMachineSpec::new("dev", VmType::Firecracker);
        let inst = Instance::new(spec, Dirs::new(tmp.path())).unwrap();
        let provisioner = DiskProvisioner::new(
            Downloader::new(None).unwrap(),
            Arc::new(CountingConverter::default()),
        );
        assert!(matches!(
            provisioner.ensure_disk(&inst).await,
            Err(DiskError::NoImage(_))
        ));
    }
}
