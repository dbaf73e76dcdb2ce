//! WSL2 backend.
//!
//! The base image is imported once as distro `hearth-<name>`. Start launches
//! the guest agent inside the distro as a long-running `wsl.exe` child and
//! learns the guest address with `hostname -I`. Resources are managed by WSL
//! itself.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{Driver, DriverConfig, DriverError, ErrorChannel, GUEST_AGENT_PORT};
use crate::cidata::GUEST_AGENT_BINARY;
use crate::forward::{BoxedStream, GuestDialer};
use crate::instance::{filenames, Instance};

const ADDRESS_TIMEOUT: Duration = Duration::from_secs(30);
const ADDRESS_POLL: Duration = Duration::from_secs(1);

/// `wsl.exe` prints UTF-16LE for most subcommands and UTF-8 for commands run
/// inside a distro.
pub fn decode_wsl_output(raw: &[u8]) -> String {
    let (raw, has_bom) = match raw.strip_prefix(&[0xffu8, 0xfe][..]) {
        Some(rest) => (rest, true),
        None => (raw, false),
    };
    let looks_utf16 = has_bom
        || (raw.len() >= 2
            && raw.len() % 2 == 0
            && raw.iter().skip(1).step_by(2).all(|b| *b == 0));
    let text = if looks_utf16 {
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(raw).into_owned()
    };
    text.trim_start_matches('\u{feff}').to_string()
}

struct Running {
    stopping: Arc<AtomicBool>,
    kill: CancellationToken,
    watcher: tokio::task::JoinHandle<()>,
}

pub struct Wsl2Driver {
    distro: String,
    dir: PathBuf,
    wsl_exe: PathBuf,
    address: StdMutex<Option<String>>,
    running: Mutex<Option<Running>>,
}

impl Wsl2Driver {
    pub fn new(instance: &Instance, config: &DriverConfig) -> Self {
        Self {
            distro: format!("hearth-{}", instance.name()),
            dir: instance.dir().to_path_buf(),
            wsl_exe: config.wsl_exe.clone(),
            address: StdMutex::new(None),
            running: Mutex::new(None),
        }
    }

    async fn wsl(&self, args: &[&str]) -> Result<String, DriverError> {
        let program = self.wsl_exe.display().to_string();
        let output = Command::new(&self.wsl_exe)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| DriverError::Spawn {
                program: program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(DriverError::Command {
                program: format!("{program} {}", args.join(" ")),
                stderr: decode_wsl_output(&output.stderr).trim().to_string(),
            });
        }
        Ok(decode_wsl_output(&output.stdout))
    }

    async fn ensure_distro(&self) -> Result<(), DriverError> {
        let listed = self.wsl(&["--list", "--quiet"]).await?;
        if listed.lines().any(|l| l.trim() == self.distro) {
            debug!(distro = %self.distro, "Distro already imported");
            return Ok(());
        }

        let install_dir = self.dir.join(filenames::WSL_DISTRO_DIR);
        std::fs::create_dir_all(&install_dir).map_err(|e| DriverError::io(&install_dir, e))?;
        let base = self.dir.join(filenames::BASE_DISK);
        let install = install_dir.display().to_string();
        let base = base.display().to_string();
        self.wsl(&["--import", &self.distro, &install, &base, "--version", "2"])
            .await?;
        info!(distro = %self.distro, "Imported distro");
        Ok(())
    }

    /// Shell command that runs the guest agent off the cidata directory.
    fn boot_command(&self) -> String {
        let cidata = self.dir.join(filenames::CIDATA_DIR);
        format!(
            "dir=\"$(wslpath -u '{}')\" && exec \"$dir/{GUEST_AGENT_BINARY}\" --cidata \"$dir\"",
            cidata.display()
        )
    }

    async fn guest_address(&self) -> Result<String, DriverError> {
        let deadline = tokio::time::Instant::now() + ADDRESS_TIMEOUT;
        loop {
            match self
                .wsl(&["-d", &self.distro, "-u", "root", "--", "hostname", "-I"])
                .await
            {
                Ok(out) => {
                    if let Some(addr) = out.split_whitespace().next() {
                        return Ok(addr.to_string());
                    }
                }
                Err(e) => debug!(error = %e, "Guest address not available yet"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DriverError::Timeout("WSL guest address"));
            }
            tokio::time::sleep(ADDRESS_POLL).await;
        }
    }

    fn current_address(&self) -> Option<String> {
        self.address
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Driver for Wsl2Driver {
    fn name(&self) -> &'static str {
        "wsl2"
    }

    async fn start(&self, _cancel: CancellationToken) -> Result<ErrorChannel, DriverError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(DriverError::Config("already started".to_string()));
        }

        self.ensure_distro().await?;

        let mut child: Child = Command::new(&self.wsl_exe)
            .args(["-d", &self.distro, "-u", "root", "--", "/bin/sh", "-c"])
            .arg(self.boot_command())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DriverError::Spawn {
                program: self.wsl_exe.display().to_string(),
                source,
            })?;

        let address = match self.guest_address().await {
            Ok(address) => address,
            Err(e) => {
                child.kill().await.ok();
                return Err(e);
            }
        };
        info!(distro = %self.distro, address = %address, "Distro running");
        *self
            .address
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(address);

        let (tx, rx) = mpsc::channel(1);
        let stopping = Arc::new(AtomicBool::new(false));
        let kill = CancellationToken::new();
        let watcher = {
            let stopping = stopping.clone();
            let kill = kill.clone();
            tokio::spawn(
                async move {
                    tokio::select! {
                        status = child.wait() => {
                            if !stopping.load(Ordering::SeqCst) {
                                let err = match status {
                                    Ok(status) => anyhow!("WSL guest agent exited: {status}"),
                                    Err(e) => anyhow!("waiting for WSL guest agent: {e}"),
                                };
                                tx.send(err).await.ok();
                            }
                        }
                        _ = kill.cancelled() => {
                            child.kill().await.ok();
                        }
                    }
                }
                .instrument(info_span!("wsl2", distro = %self.distro)),
            )
        };

        *running = Some(Running {
            stopping,
            kill,
            watcher,
        });
        Ok(rx)
    }

    async fn stop(&self) -> Result<(), DriverError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        running.stopping.store(true, Ordering::SeqCst);

        if let Err(e) = self.wsl(&["--terminate", &self.distro]).await {
            warn!(distro = %self.distro, error = %e, "Failed to terminate distro");
        }
        running.kill.cancel();
        running.watcher.await.ok();
        info!(distro = %self.distro, "Distro stopped");
        Ok(())
    }

    async fn dialer(&self) -> Result<Arc<dyn GuestDialer>, DriverError> {
        let address = self.current_address().ok_or(DriverError::NotRunning)?;
        Ok(Arc::new(TcpGuestDialer { address }))
    }

    async fn guest_connection(&self) -> Result<BoxedStream, DriverError> {
        let address = self.current_address().ok_or(DriverError::NotRunning)?;
        TcpGuestDialer { address }
            .dial(GUEST_AGENT_PORT)
            .await
            .map_err(DriverError::Connect)
    }

    fn ssh_address(&self) -> Option<String> {
        self.current_address()
    }
}

/// Guest-channel ports are plain TCP ports on the distro's address.
struct TcpGuestDialer {
    address: String,
}

#[async_trait]
impl GuestDialer for TcpGuestDialer {
    async fn dial(&self, port: u32) -> std::io::Result<BoxedStream> {
        let port = u16::try_from(port).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "port out of range")
        })?;
        let stream = TcpStream::connect((self.address.as_str(), port)).await?;
        Ok(Box::new(stream))
    }
}
