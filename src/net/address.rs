//! Socket and authority addresses.
//!
//! # Responsibilities
//! - Describe a bind or connect target (host/port pair or domain socket path)
//! - Describe an HTTP authority (`host[:port]`)
//! - Report the address a listener actually bound to
//!
//! # Design Decisions
//! - Inet ports are `i32`: `0` asks for an ephemeral port and negative values
//!   select a shared ephemeral group (see `identity.rs`)
//! - Hostnames are kept unresolved; resolution happens at bind/connect time

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Prefix used to spell a domain socket address as a string.
const UNIX_PREFIX: &str = "unix:";

/// A bind or connect target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SocketAddress {
    /// Host (name or literal IP) and port.
    Inet { host: String, port: i32 },
    /// Filesystem path of a domain socket.
    DomainSocket { path: PathBuf },
}

impl SocketAddress {
    pub fn inet(host: impl Into<String>, port: i32) -> Self {
        SocketAddress::Inet {
            host: host.into(),
            port,
        }
    }

    pub fn domain_socket(path: impl Into<PathBuf>) -> Self {
        SocketAddress::DomainSocket { path: path.into() }
    }

    pub fn is_domain_socket(&self) -> bool {
        matches!(self, SocketAddress::DomainSocket { .. })
    }

    /// Host for inet addresses.
    pub fn host(&self) -> Option<&str> {
        match self {
            SocketAddress::Inet { host, .. } => Some(host),
            SocketAddress::DomainSocket { .. } => None,
        }
    }

    /// Port for inet addresses, `0` for domain sockets.
    pub fn port(&self) -> i32 {
        match self {
            SocketAddress::Inet { port, .. } => *port,
            SocketAddress::DomainSocket { .. } => 0,
        }
    }

    /// Path for domain socket addresses.
    pub fn path(&self) -> Option<&Path> {
        match self {
            SocketAddress::Inet { .. } => None,
            SocketAddress::DomainSocket { path } => Some(path),
        }
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(addr: SocketAddr) -> Self {
        SocketAddress::inet(addr.ip().to_string(), i32::from(addr.port()))
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Inet { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            SocketAddress::Inet { host, port } => write!(f, "{}:{}", host, port),
            SocketAddress::DomainSocket { path } => write!(f, "{}{}", UNIX_PREFIX, path.display()),
        }
    }
}

/// Error returned when an address string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid socket address {input:?}: {reason}")]
pub struct AddressParseError {
    pub input: String,
    pub reason: &'static str,
}

impl FromStr for SocketAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason| AddressParseError {
            input: s.to_string(),
            reason,
        };

        if let Some(path) = s.strip_prefix(UNIX_PREFIX) {
            if path.is_empty() {
                return Err(fail("empty domain socket path"));
            }
            return Ok(SocketAddress::domain_socket(path));
        }

        let (host, port) = s.rsplit_once(':').ok_or_else(|| fail("missing port"))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(fail("missing host"));
        }
        let port: i32 = port.parse().map_err(|_| fail("port is not a number"))?;
        if port > i32::from(u16::MAX) {
            return Err(fail("port out of range"));
        }
        Ok(SocketAddress::inet(host, port))
    }
}

impl TryFrom<String> for SocketAddress {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SocketAddress> for String {
    fn from(addr: SocketAddress) -> Self {
        addr.to_string()
    }
}

/// The address a listener is actually bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocalAddress {
    Inet(SocketAddr),
    DomainSocket(PathBuf),
}

impl LocalAddress {
    /// Bound port, `0` for domain sockets.
    pub fn port(&self) -> u16 {
        match self {
            LocalAddress::Inet(addr) => addr.port(),
            LocalAddress::DomainSocket(_) => 0,
        }
    }

    pub fn as_inet(&self) -> Option<SocketAddr> {
        match self {
            LocalAddress::Inet(addr) => Some(*addr),
            LocalAddress::DomainSocket(_) => None,
        }
    }
}

impl fmt::Display for LocalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalAddress::Inet(addr) => write!(f, "{}", addr),
            LocalAddress::DomainSocket(path) => write!(f, "{}{}", UNIX_PREFIX, path.display()),
        }
    }
}

/// An HTTP authority: host plus optional port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAndPort {
    pub host: String,
    pub port: Option<u16>,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
        }
    }

    /// Authority without an explicit port.
    pub fn host_only(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inet_and_negative_ports() {
        assert_eq!("localhost:8080".parse::<SocketAddress>().unwrap(), SocketAddress::inet("localhost", 8080));
        assert_eq!("0.0.0.0:-2".parse::<SocketAddress>().unwrap(), SocketAddress::inet("0.0.0.0", -2));
        assert_eq!("[::1]:0".parse::<SocketAddress>().unwrap(), SocketAddress::inet("::1", 0));
    }

    #[test]
    fn parses_domain_socket() {
        let addr: SocketAddress = "unix:/tmp/app.sock".parse().unwrap();
        assert!(addr.is_domain_socket());
        assert_eq!(addr.path(), Some(Path::new("/tmp/app.sock")));
        assert_eq!(addr.to_string(), "unix:/tmp/app.sock");
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!("localhost".parse::<SocketAddress>().is_err());
        assert!(":80".parse::<SocketAddress>().is_err());
        assert!("host:http".parse::<SocketAddress>().is_err());
        assert!("host:70000".parse::<SocketAddress>().is_err());
        assert!("unix:".parse::<SocketAddress>().is_err());
    }

    #[test]
    fn display_brackets_ipv6() {
        assert_eq!(SocketAddress::inet("::1", 443).to_string(), "[::1]:443");
        assert_eq!(HostAndPort::host_only("example.com").to_string(), "example.com");
    }
}
