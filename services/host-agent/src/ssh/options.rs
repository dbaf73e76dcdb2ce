//! SSH client options and their textual forms.

use std::fmt;
use std::io::Write;
use std::process::Command;
use std::str::FromStr;

use tracing::{info, warn};

use super::SshError;

/// OpenSSH client version, e.g. `8.9p1` → `8.9.1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct OpenSshVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl OpenSshVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse the banner `ssh -V` prints, e.g. `OpenSSH_9.6p1 Ubuntu-3ubuntu13`.
    pub fn parse(banner: &str) -> Option<Self> {
        let rest = banner.trim_start().strip_prefix("OpenSSH_")?;
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '.'))
            .unwrap_or(rest.len());
        let token = &rest[..end];

        let (version, patch) = match token.split_once('p') {
            Some((version, patch)) => (version, patch.parse().ok()?),
            None => (token, 0),
        };
        let (major, minor) = version.split_once('.')?;
        Some(Self::new(major.parse().ok()?, minor.parse().ok()?, patch))
    }
}

impl fmt::Display for OpenSshVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// First client release accepting `Ciphers=^...` to prepend to the defaults.
const CIPHER_PREPEND_SINCE: OpenSshVersion = OpenSshVersion::new(8, 1, 0);

/// Host facts that shape the option set. Computed once per process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshCapabilities {
    pub openssh_version: Option<OpenSshVersion>,
    pub aes_accelerated: bool,
}

impl SshCapabilities {
    /// Probe the local `ssh` client and the CPU.
    pub fn detect() -> Self {
        let openssh_version = match Command::new("ssh").arg("-V").output() {
            Ok(out) => {
                let banner = String::from_utf8_lossy(&out.stderr);
                let version = OpenSshVersion::parse(&banner);
                match version {
                    Some(v) => info!(version = %v, "Detected OpenSSH client"),
                    None => warn!(banner = %banner.trim(), "Unrecognised ssh -V output"),
                }
                version
            }
            Err(e) => {
                warn!(error = %e, "Failed to run ssh -V");
                None
            }
        };

        Self {
            openssh_version,
            aes_accelerated: detect_aes_acceleration(),
        }
    }

    /// `Ciphers` value, if the client can take a preference.
    pub fn cipher_preference(&self) -> Option<&'static str> {
        let version = self.openssh_version?;
        if version < CIPHER_PREPEND_SINCE {
            return None;
        }
        Some(if self.aes_accelerated {
            "^aes128-gcm@openssh.com,aes256-gcm@openssh.com"
        } else {
            "^chacha20-poly1305@openssh.com"
        })
    }
}

fn detect_aes_acceleration() -> bool {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        std::arch::is_x86_feature_detected!("aes")
    }
    #[cfg(target_arch = "aarch64")]
    {
        std::arch::is_aarch64_feature_detected!("aes")
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
    {
        false
    }
}

/// One `Key=Value` client option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOption {
    pub key: String,
    pub value: String,
}

impl SshOption {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Option whose value is a path, wrapped in double quotes.
    pub fn quoted(key: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::new(key, format!("\"{value}\""))
    }
}

impl fmt::Display for SshOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Output flavour for [`format_options`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshFormat {
    /// `ssh -o K=V ... hearth-<name>`
    Cmd,
    /// `-o K=V ...`
    Args,
    /// One `K=V` per line.
    Options,
    /// `Host hearth-<name>` block for `~/.ssh/config`.
    Config,
}

impl FromStr for SshFormat {
    type Err = SshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cmd" => Ok(SshFormat::Cmd),
            "args" => Ok(SshFormat::Args),
            "options" => Ok(SshFormat::Options),
            "config" => Ok(SshFormat::Config),
            other => Err(SshError::UnknownFormat(other.to_string())),
        }
    }
}

/// Host alias used in generated commands and config.
pub fn host_alias(instance: &str) -> String {
    format!("hearth-{instance}")
}

// Keep the shell from swallowing double quotes.
fn shell_quote(option: &SshOption) -> String {
    let text = option.to_string();
    if text.contains('"') {
        format!("'{text}'")
    } else {
        text
    }
}

/// Write `options` for `instance` in the requested format.
pub fn format_options<W: Write>(
    w: &mut W,
    instance: &str,
    format: SshFormat,
    options: &[SshOption],
) -> std::io::Result<()> {
    let alias = host_alias(instance);
    match format {
        SshFormat::Cmd => {
            let mut args = vec!["ssh".to_string()];
            for option in options {
                args.push("-o".to_string());
                args.push(shell_quote(option));
            }
            args.push(alias);
            writeln!(w, "{}", args.join(" "))
        }
        SshFormat::Args => {
            let args: Vec<String> = options
                .iter()
                .flat_map(|o| ["-o".to_string(), shell_quote(o)])
                .collect();
            writeln!(w, "{}", args.join(" "))
        }
        SshFormat::Options => {
            for option in options {
                writeln!(w, "{option}")?;
            }
            Ok(())
        }
        SshFormat::Config => {
            writeln!(w, "Host {alias}")?;
            for option in options {
                writeln!(w, "  {} {}", option.key, option.value)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("OpenSSH_8.1p1, LibreSSL 2.7.3", Some(OpenSshVersion::new(8, 1, 1)))]
    #[case("OpenSSH_9.6p1 Ubuntu-3ubuntu13, OpenSSL 3.0.13", Some(OpenSshVersion::new(9, 6, 1)))]
    #[case("OpenSSH_7.4", Some(OpenSshVersion::new(7, 4, 0)))]
    #[case("OpenSSH_for_Windows_8.1p1", None)]
    #[case("Sun_SSH_1.1", None)]
    fn test_parse_version(#[case] banner: &str, #[case] expected: Option<OpenSshVersion>) {
        assert_eq!(OpenSshVersion::parse(banner), expected);
    }

    #[test]
    fn test_cipher_preference() {
        let mut caps = SshCapabilities {
            openssh_version: Some(OpenSshVersion::new(8, 9, 1)),
            aes_accelerated: true,
        };
        assert_eq!(
            caps.cipher_preference(),
            Some("^aes128-gcm@openssh.com,aes256-gcm@openssh.com")
        );

        caps.aes_accelerated = false;
        assert_eq!(
            caps.cipher_preference(),
            Some("^chacha20-poly1305@openssh.com")
        );

        caps.openssh_version = Some(OpenSshVersion::new(8, 0, 9));
        assert_eq!(caps.cipher_preference(), None);

        caps.openssh_version = None;
        assert_eq!(caps.cipher_preference(), None);
    }

    fn sample() -> Vec<SshOption> {
        vec![
            SshOption::quoted("IdentityFile", "/home/u/.hearth/_config/user"),
            SshOption::new("User", "u"),
            SshOption::new("Port", "60022"),
        ]
    }

    #[test]
    fn test_format_config() {
        let mut out = Vec::new();
        format_options(&mut out, "dev", SshFormat::Config, &sample()).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Host hearth-dev\n  IdentityFile \"/home/u/.hearth/_config/user\"\n  User u\n  Port 60022\n"
        );
    }

    #[test]
    fn test_format_cmd_and_args() {
        let mut out = Vec::new();
        format_options(&mut out, "dev", SshFormat::Cmd, &sample()).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "ssh -o 'IdentityFile=\"/home/u/.hearth/_config/user\"' -o User=u -o Port=60022 hearth-dev\n"
        );

        let mut out = Vec::new();
        format_options(&mut out, "dev", SshFormat::Args, &sample()[1..]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "-o User=u -o Port=60022\n");
    }

    #[test]
    fn test_format_options_and_parse() {
        let mut out = Vec::new();
        format_options(&mut out, "dev", SshFormat::Options, &sample()[1..]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "User=u\nPort=60022\n");

        assert_eq!("config".parse::<SshFormat>().unwrap(), SshFormat::Config);
        assert!("json".parse::<SshFormat>().is_err());
    }
}
