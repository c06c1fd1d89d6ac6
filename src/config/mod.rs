//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! portshare.toml
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → PortshareConfig (validated, immutable)
//!
//! On change of the file or a referenced PEM file:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → new config pushed to the binary, which applies TLS changes
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Only TLS options are applied live; other changes need a restart

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ClientAuth, KeyCertOptions, ListenerConfig, ObservabilityConfig, PemSource, PoolOptions, PortshareConfig,
    Protocol, ServerOptions, TlsOptions, TrafficShapingOptions, TrustOptions,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
