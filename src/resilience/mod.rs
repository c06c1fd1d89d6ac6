//! Request guards for outbound traffic.
//!
//! # Data Flow
//! ```text
//! ClientRequest::set_timeout
//!     → timeouts.rs (arm watchdog)
//!     → data_received → record_progress (idle timeout)
//!     → handle_response → cancel | timer fires → request failed
//! ```

pub mod timeouts;

pub use timeouts::{RequestTimeoutWatchdog, TimeoutTarget, WatchdogPhase};
