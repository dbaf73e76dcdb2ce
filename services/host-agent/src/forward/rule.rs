use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use hearth_networking::split_host_port;
use hearth_spec::PortForward;

use super::ForwardError;

/// One end of a forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `host:port`
    Tcp(String),
    Unix(PathBuf),
    /// Guest channel port, reached through a backend dialer.
    Vsock(u32),
}

impl Endpoint {
    fn parse(text: &str) -> Result<Self, ForwardError> {
        let (proto, addr) = text
            .split_once("://")
            .ok_or_else(|| ForwardError::InvalidRule(format!("missing protocol in {text:?}")))?;
        match proto {
            "tcp" => {
                let (_, port) = split_host_port(addr)?;
                port.parse::<u16>()
                    .map_err(|_| ForwardError::InvalidRule(format!("bad port in {addr:?}")))?;
                Ok(Endpoint::Tcp(addr.to_string()))
            }
            "unix" if !addr.is_empty() => Ok(Endpoint::Unix(PathBuf::from(addr))),
            "unix" => Err(ForwardError::InvalidRule("empty unix socket path".into())),
            "vsock" => addr
                .parse()
                .map(Endpoint::Vsock)
                .map_err(|_| ForwardError::InvalidRule(format!("bad vsock port {addr:?}"))),
            other => Err(ForwardError::UnsupportedProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Vsock(port) => write!(f, "vsock://{port}"),
        }
    }
}

/// `protocol://source -> protocol://destination`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardRule {
    pub source: Endpoint,
    pub destination: Endpoint,
}

impl ForwardRule {
    /// Rule for a forward declared in the VM spec.
    ///
    /// Guest ports without an explicit guest IP are reached at `guest_address`.
    pub fn from_port_forward(pf: &PortForward, guest_address: &str) -> Result<Self, ForwardError> {
        if !(pf.proto.is_empty() || pf.proto == "tcp") {
            return Err(ForwardError::UnsupportedProtocol(pf.proto.clone()));
        }

        let source = if !pf.host_socket.is_empty() {
            Endpoint::Unix(PathBuf::from(&pf.host_socket))
        } else {
            let ip = if pf.host_ip.is_empty() {
                "127.0.0.1"
            } else {
                pf.host_ip.as_str()
            };
            Endpoint::Tcp(join_host_port(ip, pf.host_port))
        };

        let destination = if pf.vsock_port != 0 {
            Endpoint::Vsock(pf.vsock_port)
        } else if !pf.guest_socket.is_empty() {
            return Err(ForwardError::InvalidRule(format!(
                "guest socket {:?} needs a guest channel port",
                pf.guest_socket
            )));
        } else {
            let ip = if pf.guest_ip.is_empty() {
                guest_address
            } else {
                pf.guest_ip.as_str()
            };
            Endpoint::Tcp(join_host_port(ip, pf.guest_port))
        };

        Ok(Self {
            source,
            destination,
        })
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

impl FromStr for ForwardRule {
    type Err = ForwardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (source, destination) = s
            .split_once("->")
            .ok_or_else(|| ForwardError::InvalidRule(format!("missing '->' in {s:?}")))?;
        let source = Endpoint::parse(source.trim())?;
        if matches!(source, Endpoint::Vsock(_)) {
            return Err(ForwardError::InvalidRule(
                "cannot listen on a guest channel".into(),
            ));
        }
        Ok(Self {
            source,
            destination: Endpoint::parse(destination.trim())?,
        })
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}
