//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validated config → bind listeners (instances handles each) → register close hooks
//!
//! Reload:
//!     ConfigWatcher → apply_tls_updates → TcpServer::update_tls_options
//!
//! Shutdown (shutdown.rs):
//!     Signal received → trigger subscribers → run close hooks → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then observability, then listeners
//! - A handle deregisters its close hook when closed normally, so shutdown
//!   never closes it twice

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{Closeable, HookId, Shutdown};
pub use signals::shutdown_signal;
pub use startup::{apply_tls_updates, start_listener, start_listeners, BoundListener, StartupError};
