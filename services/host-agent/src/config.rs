//! Configuration for the host agent.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::driver::DriverConfig;
use crate::instance::{Dirs, HOME_ENV};

/// Host agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all on-disk state.
    pub home: Dirs,

    /// JSON file holding the VM specification.
    pub spec_path: PathBuf,

    /// Firecracker binary.
    pub firecracker_bin: PathBuf,

    /// Guest kernel for Firecracker.
    pub kernel: Option<PathBuf>,

    /// `qemu-img` binary used for image conversion.
    pub qemu_img: PathBuf,

    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let home = match var(HOME_ENV) {
            Some(root) => Dirs::new(root),
            None => Dirs::from_env().context("resolving hearth home directory")?,
        };

        let spec_path = var("HEARTH_SPEC")
            .map(PathBuf::from)
            .context("HEARTH_SPEC must name the VM specification file")?;

        let firecracker_bin = var("HEARTH_FIRECRACKER_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("firecracker"));

        let kernel = var("HEARTH_KERNEL").map(PathBuf::from);

        let qemu_img = var("HEARTH_QEMU_IMG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("qemu-img"));

        let log_level = var("HEARTH_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            home,
            spec_path,
            firecracker_bin,
            kernel,
            qemu_img,
            log_level,
        })
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            firecracker_bin: self.firecracker_bin.clone(),
            kernel: self.kernel.clone(),
            ..Default::default()
        }
    }
}
