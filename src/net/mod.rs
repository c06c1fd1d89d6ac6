//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! TcpServer::bind
//!     → identity.rs (sharing plan for the address)
//!     → registry.rs (owner or joiner of the physical listener)
//!     → listener.rs (accept loop, connection limits)
//!     → load_balancer (pick a handle's worker)
//!     → handler.rs (traffic shaping, TLS handshake, protocol)
//! ```
//!
//! # Design Decisions
//! - Many logical handles share one socket per identity
//! - Each connection tracked for the listener's lifetime
//! - TLS is optional and handled transparently

pub mod address;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod handler;
pub mod identity;
pub mod listener;
pub mod registry;
pub mod server;
pub mod traffic;

pub use address::{HostAndPort, LocalAddress, SocketAddress};
pub use error::ServerError;
pub use event_loop::{EventLoop, LoopId};
pub use handler::{ConnectionContext, ConnectionHandler, NetSocket, StreamHandler};
pub use registry::ServerRegistry;
pub use server::{BindStatus, SharedServer, TcpServer, TcpServerBuilder};
pub use traffic::TrafficShaper;
