//! # Address Candidates
//!
//! An [`AddressCandidate`] is one endpoint through which a peer might be
//! reachable. Values are validated at construction, so a malformed host or
//! port never exists as a candidate.
//!
//! ## Host Classification
//!
//! ```text
//! contains ':'          -> IPv6 literal (zone index "%eth0" stripped)
//! only digits and '.'   -> IPv4 literal
//! anything else         -> RFC 1123 hostname
//! ```
//!
//! Equality is structural over `(host, port)`. Candidates serialize as their
//! `host:port` string and are re-validated when deserialized.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const MIN_PORT: u16 = 1;
pub const MAX_PORT: u16 = u16::MAX;

const MAX_HOSTNAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;

/// Upper bound on candidates built for a single peer.
pub const MAX_CONNECT_CANDIDATES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid IPv4 address: {0}")]
    InvalidIpv4(String),
    #[error("invalid IPv6 address: {0}")]
    InvalidIpv6(String),
    #[error("invalid hostname: {0}")]
    InvalidHostname(String),
    #[error("port {0} out of range")]
    InvalidPort(u32),
    #[error("malformed address: {0}")]
    Malformed(String),
    #[error("invalid network: {0}")]
    InvalidNetwork(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum HostKind {
    Ipv4,
    Ipv6,
    Hostname,
}

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AddressCandidate {
    host: String,
    port: u16,
    kind: HostKind,
}

impl AddressCandidate {
    pub fn new(host: &str, port: u16) -> Result<Self, AddressError> {
        if port < MIN_PORT {
            return Err(AddressError::InvalidPort(port as u32));
        }

        let (host, kind) = if host.contains(':') {
            let stripped = host.split('%').next().unwrap_or(host);
            let ip = Ipv6Addr::from_str(stripped)
                .map_err(|_| AddressError::InvalidIpv6(host.to_string()))?;
            (ip.to_string(), HostKind::Ipv6)
        } else if !host.is_empty() && host.chars().all(|c| c.is_ascii_digit() || c == '.') {
            let ip = Ipv4Addr::from_str(host)
                .map_err(|_| AddressError::InvalidIpv4(host.to_string()))?;
            (ip.to_string(), HostKind::Ipv4)
        } else {
            validate_hostname(host)?;
            (host.to_ascii_lowercase(), HostKind::Hostname)
        };

        Ok(Self { host, port, kind })
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Result<Self, AddressError> {
        Self::new(&addr.ip().to_string(), addr.port())
    }

    /// Parses `host:port` or `[v6]:port`.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| AddressError::Malformed(s.to_string()))?;
            (host, port)
        } else {
            s.rsplit_once(':')
                .ok_or_else(|| AddressError::Malformed(s.to_string()))?
        };

        let port: u32 = port
            .parse()
            .map_err(|_| AddressError::Malformed(s.to_string()))?;
        if port > MAX_PORT as u32 {
            return Err(AddressError::InvalidPort(port));
        }
        Self::new(host, port as u16)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ipv6(&self) -> bool {
        self.kind == HostKind::Ipv6
    }

    pub fn is_hostname(&self) -> bool {
        self.kind == HostKind::Hostname
    }

    pub fn with_port(&self, port: u16) -> Result<Self, AddressError> {
        Self::new(&self.host, port)
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self.kind {
            HostKind::Hostname => None,
            _ => IpAddr::from_str(&self.host).ok(),
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Loopback, link-local, RFC 1918 and unique-local addresses.
    pub fn is_private(&self) -> bool {
        match self.ip() {
            Some(IpAddr::V4(ip)) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
            Some(IpAddr::V6(ip)) => ip.is_loopback() || (ip.segments()[0] & 0xfe00) == 0xfc00,
            None => false,
        }
    }
}

fn validate_hostname(host: &str) -> Result<(), AddressError> {
    let invalid = || AddressError::InvalidHostname(host.to_string());

    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return Err(invalid());
    }
    let trimmed = host.strip_suffix('.').unwrap_or(host);
    if trimmed.is_empty() {
        return Err(invalid());
    }

    for label in trimmed.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(invalid());
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid());
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid());
        }
    }
    Ok(())
}

impl fmt::Display for AddressCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for AddressCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddressCandidate({})", self)
    }
}

impl FromStr for AddressCandidate {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AddressCandidate {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<AddressCandidate> for String {
    fn from(candidate: AddressCandidate) -> Self {
        candidate.to_string()
    }
}

/// An IPv4 network in CIDR notation, e.g. `192.168.1.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Network {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Network {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, AddressError> {
        if prefix > 32 {
            return Err(AddressError::InvalidNetwork(format!("{addr}/{prefix}")));
        }
        Ok(Self { addr, prefix })
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix as u32)
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = self.mask();
        (u32::from(self.addr) & mask) == (u32::from(ip) & mask)
    }

    /// Network of an interface address with the given netmask. Non-contiguous
    /// masks are rounded to their leading ones.
    pub fn from_netmask(addr: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        let prefix = u32::from(netmask).leading_ones() as u8;
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix as u32) };
        Self {
            addr: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        }
    }
}

/// Assumed prefix of a private host whose netmask is unknown.
pub const DEFAULT_HOST_PREFIX: u8 = 24;

fn host_netmask() -> Ipv4Addr {
    Ipv4Addr::from(u32::MAX << (32 - DEFAULT_HOST_PREFIX as u32))
}

/// IPv4 networks of this host's interfaces. Failure to enumerate the
/// interfaces yields an empty list.
pub fn interface_networks() -> Vec<Ipv4Network> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter_map(|iface| match iface.addr {
                if_addrs::IfAddr::V4(v4) => {
                    let net = Ipv4Network::from_netmask(v4.ip, v4.netmask);
                    debug!(interface = %iface.name, network = %net, "local network");
                    Some(net)
                }
                if_addrs::IfAddr::V6(_) => None,
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "failed to list network interfaces");
            Vec::new()
        }
    }
}

impl fmt::Display for Ipv4Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Ipv4Network {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddressError::InvalidNetwork(s.to_string());
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr = Ipv4Addr::from_str(addr).map_err(|_| invalid())?;
        let prefix = prefix.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix)
    }
}

/// Decides whether a candidate is worth dialing from this node.
///
/// IPv6 candidates require IPv6 to be enabled; private IPv4 candidates are
/// only reachable when they sit inside one of our own local networks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    pub use_ipv6: bool,
    pub local_networks: Vec<Ipv4Network>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            use_ipv6: false,
            local_networks: vec![Ipv4Network {
                addr: Ipv4Addr::LOCALHOST,
                prefix: 8,
            }],
        }
    }
}

impl AccessPolicy {
    /// Adds `network` unless an equal or wider known network already covers it.
    pub fn add_local_network(&mut self, network: Ipv4Network) -> bool {
        let covered = self
            .local_networks
            .iter()
            .any(|known| known.prefix <= network.prefix && known.contains(network.addr));
        if !covered {
            self.local_networks.push(network);
        }
        !covered
    }

    /// Makes the network of our own private `host` reachable. Hostnames and
    /// public addresses are left alone.
    pub fn add_host_network(&mut self, host: &str) -> bool {
        match host.parse::<Ipv4Addr>() {
            Ok(ip) if ip.is_private() || ip.is_link_local() => {
                self.add_local_network(Ipv4Network::from_netmask(ip, host_netmask()))
            }
            _ => false,
        }
    }

    pub fn is_accessible(&self, candidate: &AddressCandidate) -> bool {
        match candidate.ip() {
            None => true,
            Some(IpAddr::V6(_)) => self.use_ipv6,
            Some(IpAddr::V4(ip)) => {
                if !candidate.is_private() {
                    return true;
                }
                self.local_networks.iter().any(|net| net.contains(ip))
            }
        }
    }

    pub fn filter(&self, candidates: Vec<AddressCandidate>) -> Vec<AddressCandidate> {
        candidates
            .into_iter()
            .filter(|c| self.is_accessible(c))
            .collect()
    }
}
