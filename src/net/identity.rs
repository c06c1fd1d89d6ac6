//! Registry identity of a physical listener.
//!
//! # Sharing rules
//! ```text
//! port > 0 or domain socket  → shared by (port, host-or-path), bound as given
//! port < 0                   → shared by (port, "host/|port|"), bound to an ephemeral port
//! port == 0                  → never shared, bound to an ephemeral port
//! ```

use std::fmt;

use crate::net::address::SocketAddress;

/// Identity under which a physical listener is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerIdentity {
    pub port: i32,
    pub host_or_path: String,
}

impl ServerIdentity {
    pub fn new(port: i32, host_or_path: impl Into<String>) -> Self {
        Self {
            port,
            host_or_path: host_or_path.into(),
        }
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_or_path, self.port)
    }
}

/// How a bind request participates in listener sharing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sharing {
    /// Registered under the identity; other handles may join.
    Shared(ServerIdentity),
    /// A private listener nobody else can join.
    Exclusive,
}

/// Outcome of resolving a requested address: registry sharing plus the
/// address the socket is actually bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindPlan {
    pub sharing: Sharing,
    pub bind_address: SocketAddress,
}

impl BindPlan {
    pub fn for_address(address: &SocketAddress) -> Self {
        match address {
            SocketAddress::DomainSocket { path } => BindPlan {
                sharing: Sharing::Shared(ServerIdentity::new(0, path.to_string_lossy())),
                bind_address: address.clone(),
            },
            SocketAddress::Inet { host, port } if *port > 0 => BindPlan {
                sharing: Sharing::Shared(ServerIdentity::new(*port, host.clone())),
                bind_address: address.clone(),
            },
            SocketAddress::Inet { host, port } if *port < 0 => BindPlan {
                sharing: Sharing::Shared(ServerIdentity::new(*port, format!("{}/{}", host, -i64::from(*port)))),
                bind_address: SocketAddress::inet(host.clone(), 0),
            },
            SocketAddress::Inet { .. } => BindPlan {
                sharing: Sharing::Exclusive,
                bind_address: address.clone(),
            },
        }
    }

    pub fn identity(&self) -> Option<&ServerIdentity> {
        match &self.sharing {
            Sharing::Shared(id) => Some(id),
            Sharing::Exclusive => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_ports_share_by_host_and_port() {
        let plan = BindPlan::for_address(&SocketAddress::inet("localhost", 8080));
        assert_eq!(plan.identity(), Some(&ServerIdentity::new(8080, "localhost")));
        assert_eq!(plan.bind_address, SocketAddress::inet("localhost", 8080));
    }

    #[test]
    fn port_zero_is_exclusive() {
        let plan = BindPlan::for_address(&SocketAddress::inet("127.0.0.1", 0));
        assert_eq!(plan.sharing, Sharing::Exclusive);
    }

    #[test]
    fn negative_ports_encode_group_in_host() {
        let plan = BindPlan::for_address(&SocketAddress::inet("127.0.0.1", -3));
        assert_eq!(plan.identity(), Some(&ServerIdentity::new(-3, "127.0.0.1/3")));
        assert_eq!(plan.bind_address, SocketAddress::inet("127.0.0.1", 0));

        let other = BindPlan::for_address(&SocketAddress::inet("127.0.0.1", -4));
        assert_ne!(plan.identity(), other.identity());
    }

    #[test]
    fn domain_sockets_share_by_path() {
        let plan = BindPlan::for_address(&SocketAddress::domain_socket("/tmp/a.sock"));
        assert_eq!(plan.identity(), Some(&ServerIdentity::new(0, "/tmp/a.sock")));
    }
}
