//! VNC display setup.

use rand::Rng;
use tracing::info;

use super::AgentError;
use crate::driver::Driver;
use crate::fsutil::write_file_mode;
use crate::instance::{filenames, Instance};

pub const VNC_BASE_PORT: u16 = 5900;
pub const PASSWORD_LEN: usize = 8;

/// Letters and digits minus the look-alikes, so the password survives copy and paste.
pub const PASSWORD_CHARSET: &str = "ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnpqrstuvwxyz23456789";

const DEFAULT_DISPLAY: &str = "127.0.0.1:0";

pub fn generate_password(len: usize) -> String {
    let charset = PASSWORD_CHARSET.as_bytes();
    let mut rng = rand::rng();
    (0..len)
        .map(|_| charset[rng.random_range(0..charset.len())] as char)
        .collect()
}

/// `host:display[,options]` from the VM spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VncDisplay {
    pub host: String,
    pub display: u16,
    pub options: String,
}

impl VncDisplay {
    pub fn parse(s: &str) -> Result<Self, AgentError> {
        let invalid = |reason: &str| AgentError::Vnc(format!("{s:?}: {reason}"));
        let (endpoint, options) = s.split_once(',').unwrap_or((s, ""));
        let (host, display) = hearth_networking::split_host_port(endpoint)
            .map_err(|e| invalid(&e.to_string()))?;
        let display: u16 = display
            .parse()
            .map_err(|_| invalid("display must be a number"))?;
        if display > u16::MAX - VNC_BASE_PORT {
            return Err(invalid("display number too large"));
        }
        Ok(Self {
            host,
            display,
            options: options.to_string(),
        })
    }

    pub fn port(&self) -> u16 {
        VNC_BASE_PORT + self.display
    }

    /// Whether the backend may pick another display (`to=N`).
    pub fn has_range(&self) -> bool {
        self.options.contains("to=")
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.display)
    }
}

/// Where the display ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VncEndpoint {
    pub display: VncDisplay,
    pub password: String,
}

/// Set a fresh password through the backend and record password and display
/// in the instance directory.
pub async fn setup_vnc(driver: &dyn Driver, instance: &Instance) -> Result<VncEndpoint, AgentError> {
    let spec = instance.spec();
    let mut display = VncDisplay::parse(spec.video.vnc.display.as_deref().unwrap_or(DEFAULT_DISPLAY))?;

    let password = generate_password(PASSWORD_LEN);
    driver.change_display_password(&password).await?;
    let password_file = instance.file(filenames::VNC_PASSWORD);
    write_file_mode(&password_file, password.as_bytes(), 0o600)
        .map_err(|e| AgentError::io(&password_file, e))?;

    if display.has_range() {
        let connection = driver.get_display_connection().await?;
        let port: u16 = connection
            .trim()
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .filter(|p| *p >= VNC_BASE_PORT)
            .ok_or_else(|| AgentError::Vnc(format!("backend reported display {connection:?}")))?;
        display.display = port - VNC_BASE_PORT;
    }

    let display_file = instance.file(filenames::VNC_DISPLAY);
    write_file_mode(&display_file, display.endpoint().as_bytes(), 0o600)
        .map_err(|e| AgentError::io(&display_file, e))?;

    let endpoint = display.endpoint();
    let url = format!("vnc://{}:{}", display.host, display.port());
    info!(
        display = %endpoint,
        url = %url,
        password_file = %password_file.display(),
        "VNC server running"
    );
    Ok(VncEndpoint { display, password })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(":1", "", 1, 5901)]
    #[case("127.0.0.1:0", "127.0.0.1", 0, 5900)]
    #[case("0.0.0.0:3,to=9", "0.0.0.0", 3, 5903)]
    fn test_parse_display(
        #[case] input: &str,
        #[case] host: &str,
        #[case] display: u16,
        #[case] port: u16,
    ) {
        let parsed = VncDisplay::parse(input).unwrap();
        assert_eq!(parsed.host, host);
        assert_eq!(parsed.display, display);
        assert_eq!(parsed.port(), port);
    }

    #[rstest]
    #[case("")]
    #[case("localhost")]
    #[case(":x")]
    #[case(":65000")]
    fn test_parse_display_rejects(#[case] input: &str) {
        assert!(matches!(VncDisplay::parse(input), Err(AgentError::Vnc(_))));
    }

    #[test]
    fn test_password_charset() {
        for _ in 0..32 {
            let password = generate_password(PASSWORD_LEN);
            assert_eq!(password.len(), PASSWORD_LEN);
            assert!(password.chars().all(|c| PASSWORD_CHARSET.contains(c)));
        }
    }

    #[test]
    fn test_range_option() {
        assert!(VncDisplay::parse(":0,to=9").unwrap().has_range());
        assert!(!VncDisplay::parse(":0").unwrap().has_range());
    }
}
