//! HTTP protocol layer.
//!
//! # Data Flow
//! ```text
//! Inbound:
//!     RawConnection → server.rs (establish, hyper auto builder) → axum Router
//!
//! Outbound:
//!     EndpointPool::acquire → request.rs (ClientRequest + timeout watchdog)
//!         → response head | reset | failure | timeout
//! ```

pub mod request;
pub mod server;

pub use request::{ClientRequest, RequestError, ResponseHead};
pub use server::{status_router, HttpHandler};
