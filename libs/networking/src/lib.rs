//! Networking utilities for the host agent.
//!
//! This library provides helpers for:
//! - IPv4 subnet matching for guest-reported addresses
//! - Per-instance host/guest link addressing
//! - Locally administered MAC address generation
//! - `host:port` splitting for display and listener endpoints

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid `host:port` pair.
    #[error("invalid host:port {0:?}: {1}")]
    InvalidHostPort(String, &'static str),

    /// Invalid MAC address.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),
}

// ============================================================================
// Subnets
// ============================================================================

/// Private subnet the guest network is expected to live in.
pub const PRIVATE_VM_SUBNET: &str = "192.168.0.0/16";

/// IPv4 prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Prefix {
    /// Base address of the prefix.
    pub address: Ipv4Addr,

    /// Prefix length (e.g., 24 for /24).
    pub prefix_len: u8,
}

impl Ipv4Prefix {
    /// Create a new prefix.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv4(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "192.168.0.0/16").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// The private VM subnet.
    pub fn private_vm_subnet() -> Self {
        Self {
            address: Ipv4Addr::new(192, 168, 0, 0),
            prefix_len: 16,
        }
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        mask_ipv4(addr, self.prefix_len) == self.address
    }

    /// Check a textual address, accepting both `a.b.c.d` and `a.b.c.d/len`.
    ///
    /// Unparseable input is reported as not contained.
    pub fn contains_str(&self, addr: &str) -> bool {
        let host = addr.split_once('/').map_or(addr, |(host, _)| host);
        Ipv4Addr::from_str(host.trim()).is_ok_and(|ip| self.contains(ip))
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len.min(32)))
    };
    Ipv4Addr::from(bits & mask)
}

/// Point-to-point /24 between the host TAP device and one guest.
///
/// The third octet is derived from a seed so sibling instances rarely collide;
/// the host takes `.1` and the guest `.2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestLink {
    pub host: Ipv4Addr,
    pub guest: Ipv4Addr,
    pub prefix_len: u8,
}

impl GuestLink {
    pub fn for_seed(seed: &str) -> Self {
        let digest = Sha256::digest(seed.as_bytes());
        // third octet in 1..=254
        let octet = 1 + digest[0] % 254;
        Self {
            host: Ipv4Addr::new(192, 168, octet, 1),
            guest: Ipv4Addr::new(192, 168, octet, 2),
            prefix_len: 24,
        }
    }

    pub fn guest_cidr(&self) -> String {
        format!("{}/{}", self.guest, self.prefix_len)
    }

    pub fn host_cidr(&self) -> String {
        format!("{}/{}", self.host, self.prefix_len)
    }
}

// ============================================================================
// MAC addresses
// ============================================================================

/// Vendor prefix used for generated guest NICs.
pub const MAC_PREFIX: [u8; 3] = [0x52, 0x55, 0x55];

/// An Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Derive a stable MAC from an arbitrary seed (usually an instance UUID).
    ///
    /// The first three octets are [`MAC_PREFIX`], the rest come from the
    /// SHA-256 of the seed, so the same seed always yields the same address.
    pub fn generate(seed: &str) -> Self {
        let digest = Sha256::digest(seed.as_bytes());
        Self([
            MAC_PREFIX[0],
            MAC_PREFIX[1],
            MAC_PREFIX[2],
            digest[0],
            digest[1],
            digest[2],
        ])
    }

    /// Raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| NetworkError::InvalidMac(s.to_string()))?;
            *octet =
                u8::from_str_radix(part, 16).map_err(|_| NetworkError::InvalidMac(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(NetworkError::InvalidMac(s.to_string()));
        }
        Ok(Self(octets))
    }
}

// ============================================================================
// host:port
// ============================================================================

/// Split `host:port` into its parts.
///
/// The host may be empty (`":1"`) or a bracketed IPv6 literal (`"[::1]:5"`).
pub fn split_host_port(s: &str) -> Result<(String, String), NetworkError> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| NetworkError::InvalidHostPort(s.to_string(), "missing ']'"))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| NetworkError::InvalidHostPort(s.to_string(), "missing port"))?;
        return Ok((host.to_string(), port.to_string()));
    }

    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| NetworkError::InvalidHostPort(s.to_string(), "missing port"))?;
    if host.contains(':') {
        return Err(NetworkError::InvalidHostPort(
            s.to_string(),
            "too many colons",
        ));
    }
    Ok((host.to_string(), port.to_string()))
}
