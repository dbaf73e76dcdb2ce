//! hearth Host Agent
//!
//! Supervises one VM instance. The specification is read from the JSON file
//! named by `HEARTH_SPEC`; status events go to stdout as JSON lines and logs
//! go to stderr.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use hearth_host_agent::agent::{AgentServices, HostAgent};
use hearth_host_agent::cidata::ExternalIsoWriter;
use hearth_host_agent::config::Config;
use hearth_host_agent::disk::QemuImgConverter;
use hearth_host_agent::download::Downloader;
use hearth_host_agent::driver::new_driver;
use hearth_host_agent::events::EventEmitter;
use hearth_host_agent::instance::Instance;
use hearth_host_agent::mapping::UpnpMapper;
use hearth_host_agent::ssh::SshCapabilities;
use hearth_spec::VirtualMachineSpec;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    info!(
        home = %config.home.root().display(),
        spec = %config.spec_path.display(),
        "Starting hearth host agent"
    );

    let raw = std::fs::read(&config.spec_path)
        .with_context(|| format!("reading {}", config.spec_path.display()))?;
    let spec = VirtualMachineSpec::from_json(&raw).context("parsing VM specification")?;
    let instance = Instance::new(spec, config.home.clone())?;
    let driver = new_driver(&instance, &config.driver_config())?;

    let services = AgentServices {
        downloader: Downloader::new(Some(config.home.cache_dir()))?,
        converter: Arc::new(QemuImgConverter::new(&config.qemu_img)),
        iso_writer: Arc::new(ExternalIsoWriter::default()),
        mapper: Arc::new(UpnpMapper::new()?),
        ssh_caps: Arc::new(SshCapabilities::detect()),
        events: Arc::new(EventEmitter::stdout()),
    };
    let agent = HostAgent::new(instance, driver, services);

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), cancel.clone()));

    if let Err(e) = agent.run(cancel).await {
        error!(error = %e, "Host agent exited with error");
        return Err(e.into());
    }
    info!("Host agent shutdown complete");
    Ok(())
}

/// Cancels the agent once `signal` fires. A listener that cannot be installed
/// leaves the agent running.
async fn cancel_on_signal<F>(signal: F, cancel: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Received shutdown signal");
            cancel.cancel();
        }
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_cancels() {
        let cancel = CancellationToken::new();
        cancel_on_signal(async { Ok(()) }, cancel.clone()).await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_listener_failure_keeps_running() {
        let cancel = CancellationToken::new();
        let failed = async { Err(std::io::Error::new(std::io::ErrorKind::Other, "no signal handler")) };
        cancel_on_signal(failed, cancel.clone()).await;
        assert!(!cancel.is_cancelled());
    }
}
