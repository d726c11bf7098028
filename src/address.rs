//! Self-describing peer addresses.
//!
//! Addresses are written as a sequence of `/protocol/value` components, for
//! example `/ip4/127.0.0.1/tcp/4001/ws/p2p/<hex peer id>`. The components pick
//! the carrier (`tcp`, `ws`, `memory`), the network location, and optionally
//! pin the peer expected at the other end.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Dns(String),
    Dns4(String),
    Dns6(String),
    Tcp(u16),
    Ws,
    Memory(u64),
    P2p(PeerId),
}

/// Underlying byte carrier an address resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Carrier {
    Tcp,
    Ws,
    Memory,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddressError {
    Empty,
    MissingLeadingSlash,
    UnknownProtocol(String),
    MissingValue(&'static str),
    InvalidValue { protocol: &'static str, value: String },
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "address is empty"),
            Self::MissingLeadingSlash => write!(f, "address must start with '/'"),
            Self::UnknownProtocol(name) => write!(f, "unknown address protocol: {}", name),
            Self::MissingValue(proto) => write!(f, "missing value for /{}", proto),
            Self::InvalidValue { protocol, value } => {
                write!(f, "invalid value for /{}: {}", protocol, value)
            }
        }
    }
}

impl std::error::Error for AddressError {}

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PeerAddress {
    components: Vec<Protocol>,
}

impl PeerAddress {
    pub fn from_components(components: Vec<Protocol>) -> Self {
        Self { components }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => Protocol::Ip4(v4),
            IpAddr::V6(v6) => Protocol::Ip6(v6),
        };
        Self::from_components(vec![ip, Protocol::Tcp(addr.port())])
    }

    pub fn ws(addr: SocketAddr) -> Self {
        let mut out = Self::tcp(addr);
        out.components.push(Protocol::Ws);
        out
    }

    pub fn memory(port: u64) -> Self {
        Self::from_components(vec![Protocol::Memory(port)])
    }

    pub fn components(&self) -> &[Protocol] {
        &self.components
    }

    /// Peer pinned by a trailing `/p2p/` component.
    pub fn peer_id(&self) -> Option<PeerId> {
        match self.components.last() {
            Some(Protocol::P2p(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn with_peer_id(&self, peer: PeerId) -> Self {
        let mut out = self.without_peer_id();
        out.components.push(Protocol::P2p(peer));
        out
    }

    pub fn without_peer_id(&self) -> Self {
        let components = self
            .components
            .iter()
            .filter(|c| !matches!(c, Protocol::P2p(_)))
            .cloned()
            .collect();
        Self { components }
    }

    /// Carrier selected by the address scheme, `None` for unusable combinations.
    pub fn carrier(&self) -> Option<Carrier> {
        let transport: Vec<&Protocol> = self
            .components
            .iter()
            .filter(|c| !matches!(c, Protocol::P2p(_)))
            .collect();
        match transport.as_slice() {
            [Protocol::Memory(_)] => Some(Carrier::Memory),
            [host, Protocol::Tcp(_)] if is_host(host) => Some(Carrier::Tcp),
            [host, Protocol::Tcp(_), Protocol::Ws] if is_host(host) => Some(Carrier::Ws),
            _ => None,
        }
    }

    /// `host:port` form accepted by `TcpStream::connect` and `TcpListener::bind`.
    pub fn dial_target(&self) -> Option<String> {
        let mut host = None;
        let mut port = None;
        for component in &self.components {
            match component {
                Protocol::Ip4(ip) => host = Some(ip.to_string()),
                Protocol::Ip6(ip) => host = Some(format!("[{}]", ip)),
                Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
                    host = Some(name.clone())
                }
                Protocol::Tcp(p) => port = Some(*p),
                _ => {}
            }
        }
        Some(format!("{}:{}", host?, port?))
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let mut ip = None;
        let mut port = None;
        for component in &self.components {
            match component {
                Protocol::Ip4(v4) => ip = Some(IpAddr::V4(*v4)),
                Protocol::Ip6(v6) => ip = Some(IpAddr::V6(*v6)),
                Protocol::Tcp(p) => port = Some(*p),
                _ => {}
            }
        }
        Some(SocketAddr::new(ip?, port?))
    }

    pub fn memory_port(&self) -> Option<u64> {
        self.components.iter().find_map(|c| match c {
            Protocol::Memory(port) => Some(*port),
            _ => None,
        })
    }
}

fn is_host(p: &Protocol) -> bool {
    matches!(
        p,
        Protocol::Ip4(_) | Protocol::Ip6(_) | Protocol::Dns(_) | Protocol::Dns4(_) | Protocol::Dns6(_)
    )
}

fn parse_value<T: FromStr>(protocol: &'static str, value: Option<&str>) -> Result<T, AddressError> {
    let value = value.ok_or(AddressError::MissingValue(protocol))?;
    value.parse().map_err(|_| AddressError::InvalidValue {
        protocol,
        value: value.to_string(),
    })
}

impl FromStr for PeerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        let rest = s.strip_prefix('/').ok_or(AddressError::MissingLeadingSlash)?;
        let mut parts = rest.split('/').filter(|p| !p.is_empty());
        let mut components = Vec::new();

        while let Some(name) = parts.next() {
            let component = match name {
                "ip4" => Protocol::Ip4(parse_value("ip4", parts.next())?),
                "ip6" => Protocol::Ip6(parse_value("ip6", parts.next())?),
                "dns" => Protocol::Dns(parse_value("dns", parts.next())?),
                "dns4" => Protocol::Dns4(parse_value("dns4", parts.next())?),
                "dns6" => Protocol::Dns6(parse_value("dns6", parts.next())?),
                "tcp" => Protocol::Tcp(parse_value("tcp", parts.next())?),
                "ws" => Protocol::Ws,
                "memory" => Protocol::Memory(parse_value("memory", parts.next())?),
                "p2p" => {
                    let value = parts.next().ok_or(AddressError::MissingValue("p2p"))?;
                    let id = PeerId::from_hex(value).map_err(|_| AddressError::InvalidValue {
                        protocol: "p2p",
                        value: value.to_string(),
                    })?;
                    Protocol::P2p(id)
                }
                other => return Err(AddressError::UnknownProtocol(other.to_string())),
            };
            components.push(component);
        }

        if components.is_empty() {
            return Err(AddressError::Empty);
        }
        Ok(Self { components })
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for component in &self.components {
            match component {
                Protocol::Ip4(ip) => write!(f, "/ip4/{}", ip)?,
                Protocol::Ip6(ip) => write!(f, "/ip6/{}", ip)?,
                Protocol::Dns(name) => write!(f, "/dns/{}", name)?,
                Protocol::Dns4(name) => write!(f, "/dns4/{}", name)?,
                Protocol::Dns6(name) => write!(f, "/dns6/{}", name)?,
                Protocol::Tcp(port) => write!(f, "/tcp/{}", port)?,
                Protocol::Ws => write!(f, "/ws")?,
                Protocol::Memory(port) => write!(f, "/memory/{}", port)?,
                Protocol::P2p(id) => write!(f, "/p2p/{}", id.to_hex())?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self)
    }
}

impl From<PeerAddress> for String {
    fn from(addr: PeerAddress) -> Self {
        addr.to_string()
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
