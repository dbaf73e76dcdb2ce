//! Host TAP devices backing the guest NICs.
//!
//! Each guest network gets `hth<index>-<name suffix>` with the host side of its
//! [`GuestLink`] assigned. Outbound NAT for the link is host configuration.

use std::process::Command;

use hearth_networking::GuestLink;
use tracing::{debug, info, warn};

use crate::driver::DriverError;

/// Interface names are limited to IFNAMSIZ - 1.
const MAX_IFNAME: usize = 15;

pub fn tap_name(instance: &str, index: usize) -> String {
    let prefix = format!("hth{index}-");
    let room = MAX_IFNAME - prefix.len();
    let suffix = if instance.len() > room {
        &instance[instance.len() - room..]
    } else {
        instance
    };
    format!("{prefix}{suffix}")
}

fn run_ip(args: &[&str]) -> Result<(), DriverError> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|source| DriverError::Spawn {
            program: "ip".to_string(),
            source,
        })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(DriverError::Command {
            program: format!("ip {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// A TAP device, deleted on drop.
#[derive(Debug)]
pub struct TapDevice {
    name: String,
}

impl TapDevice {
    pub fn create(name: &str, link: &GuestLink) -> Result<Self, DriverError> {
        // leftover from an agent that did not shut down cleanly
        run_ip(&["link", "delete", name]).ok();

        run_ip(&["tuntap", "add", "dev", name, "mode", "tap"])?;
        let device = Self {
            name: name.to_string(),
        };
        run_ip(&["addr", "add", &link.host_cidr(), "dev", name])?;
        run_ip(&["link", "set", "dev", name, "up"])?;

        info!(tap = %name, host = %link.host, guest = %link.guest, "Created TAP device");
        Ok(device)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        match run_ip(&["link", "delete", &self.name]) {
            Ok(()) => debug!(tap = %self.name, "Deleted TAP device"),
            Err(e) => warn!(tap = %self.name, error = %e, "Failed to delete TAP device"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_name_fits_ifnamsiz() {
        assert_eq!(tap_name("dev", 0), "hth0-dev");
        let long = tap_name("a-very-long-instance-name", 1);
        assert_eq!(long.len(), MAX_IFNAME);
        assert!(long.starts_with("hth1-"));
        assert!(long.ends_with("name"));
    }
}
