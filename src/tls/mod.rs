//! TLS subsystem.
//!
//! # Data Flow
//! ```text
//! TlsOptions (config)
//!     → resolver.rs (PEM loading, rustls ServerConfig)
//!     → manager.rs (single in-flight resolution, atomic install)
//!     → net::handler (handshake with the context current at accept time)
//! ```
//!
//! # Design Decisions
//! - The active context is swapped atomically; handshakes already running
//!   keep the context they started with
//! - Only the latest requested options are ever installed
//! - Resolution is pluggable through `TlsResolver` (tests inject their own)

pub mod manager;
pub mod resolver;

use thiserror::Error;

pub use manager::TlsContextManager;
pub use resolver::{RustlsResolver, TlsContext, TlsResolver};

/// Errors raised while building or using a TLS context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TlsError {
    #[error("key/certificate is mandatory for SSL")]
    MissingCredentials,

    #[error("invalid TLS credentials: {0}")]
    InvalidCredentials(String),

    #[error("TLS context resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),
}
