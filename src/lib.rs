//! portshare: shared server binding and endpoint-keyed connection pooling.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌──────────────────────────────────────────────────────────┐
//!                  │                        PORTSHARE                         │
//!                  │                                                          │
//!   TcpServer A ───┼─▶┌──────────────┐   one entry per (protocol, identity)   │
//!   TcpServer B ───┼─▶│ServerRegistry│────────────┐                           │
//!   TcpServer C ───┼─▶└──────────────┘            ▼                           │
//!                  │                     ┌─────────────────┐                  │
//!   Client ────────┼────────────────────▶│  SharedServer   │ listener + TLS   │
//!                  │                     │ (one socket)    │ context manager  │
//!                  │                     └───────┬─────────┘                  │
//!                  │                             ▼                            │
//!                  │                     ┌─────────────────┐                  │
//!                  │                     │ ChannelBalancer │ loop → worker    │
//!                  │                     └───────┬─────────┘ round robin      │
//!                  │                             ▼                            │
//!                  │              handle's ConnectionHandler (tcp / http)     │
//!                  │                                                          │
//!                  │  Outbound:  EndpointPool ─▶ Endpoint ─▶ Lease            │
//!                  │             ConnectionLookup hooks, ClientRequest        │
//!                  │             guarded by RequestTimeoutWatchdog            │
//!                  └──────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod pool;
pub mod resilience;
pub mod tls;

pub use config::PortshareConfig;
pub use lifecycle::Shutdown;
pub use net::{ServerError, ServerRegistry, TcpServer};
pub use pool::{EndpointKey, EndpointPool};
