//! Base image conversion into a writable raw disk.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::format::{detect_format, DiskFormat};
use super::DiskError;

/// Turns a base image into a standalone raw disk.
#[async_trait]
pub trait ImageConverter: Send + Sync {
    /// Write a raw copy of `src` to `dst`, grown to at least `size` bytes.
    ///
    /// `src` must not be modified.
    async fn convert(&self, src: &Path, dst: &Path, size: u64) -> Result<(), DiskError>;
}

/// Converter backed by `qemu-img` for non-raw inputs.
#[derive(Debug, Clone)]
pub struct QemuImgConverter {
    qemu_img: PathBuf,
}

impl QemuImgConverter {
    pub fn new(qemu_img: impl Into<PathBuf>) -> Self {
        Self {
            qemu_img: qemu_img.into(),
        }
    }
}

impl Default for QemuImgConverter {
    fn default() -> Self {
        Self::new("qemu-img")
    }
}

#[async_trait]
impl ImageConverter for QemuImgConverter {
    async fn convert(&self, src: &Path, dst: &Path, size: u64) -> Result<(), DiskError> {
        let format = detect_format(src).map_err(|e| DiskError::io(src, e))?;
        debug!(src = %src.display(), dst = %dst.display(), format = %format, "Converting base image");

        match format {
            DiskFormat::Qcow2 => {
                let output = Command::new(&self.qemu_img)
                    .args(["convert", "-f", "qcow2", "-O", "raw"])
                    .arg(src)
                    .arg(dst)
                    .stdin(Stdio::null())
                    .output()
                    .await
                    .map_err(|source| DiskError::Spawn {
                        program: self.qemu_img.display().to_string(),
                        source,
                    })?;
                if !output.status.success() {
                    return Err(DiskError::Convert {
                        program: self.qemu_img.display().to_string(),
                        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    });
                }
            }
            DiskFormat::Raw | DiskFormat::Iso => {
                tokio::fs::copy(src, dst)
                    .await
                    .map_err(|e| DiskError::io(dst, e))?;
            }
        }

        grow(dst, size).await?;
        info!(dst = %dst.display(), size, "Converted base image");
        Ok(())
    }
}

/// Extend a raw file to `size`; never shrinks.
pub(crate) async fn grow(path: &Path, size: u64) -> Result<(), DiskError> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| DiskError::io(path, e))?;
    let current = file
        .metadata()
        .await
        .map_err(|e| DiskError::io(path, e))?
        .len();

    if current < size {
        file.set_len(size).await.map_err(|e| DiskError::io(path, e))?;
    } else if current > size {
        warn!(
            path = %path.display(),
            current,
            requested = size,
            "Image is larger than the requested size, not shrinking"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_raw_copy_and_grow() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("base");
        let dst = dir.path().join("diff");
        std::fs::write(&src, b"bootsector").unwrap();

        QemuImgConverter::default()
            .convert(&src, &dst, 1 << 20)
            .await
            .unwrap();

        assert_eq!(std::fs::metadata(&dst).unwrap().len(), 1 << 20);
        assert_eq!(std::fs::read(&src).unwrap(), b"bootsector");
        assert!(std::fs::read(&dst).unwrap().starts_with(b"bootsector"));
    }

    #[tokio::test]
    async fn test_missing_qemu_img_is_reported() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("base");
        std::fs::write(&src, b"QFI\xfb\0\0\0\x03").unwrap();

        let err = QemuImgConverter::new(dir.path().join("no-such-qemu-img"))
            .convert(&src, &dir.path().join("diff"), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, DiskError::Spawn { .. }));
    }
}
