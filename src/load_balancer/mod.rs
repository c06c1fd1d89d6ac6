//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Physical listener accepts a connection
//!     → channel.rs (snapshot of registered workers)
//!     → round_robin.rs (pick loop, then worker within the loop)
//!     → worker future spawned on the worker's event loop
//! ```
//!
//! # Design Decisions
//! - One balancer per physical listener, shared by every attached handle
//! - Worker membership changes never block dispatch
//! - An empty balancer is the signal that the listener can be closed

pub mod channel;
pub mod round_robin;

pub use channel::{ChannelBalancer, Selected, Worker, WorkerId};
pub use round_robin::RoundRobin;
