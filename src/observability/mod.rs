//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (tracing-subscriber fmt layer)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Metrics are cheap (atomic increments) and silent without a recorder
//! - Pool request metrics come from the `MetricsObserver` hooks, so a broken
//!   recorder can never fail a request

pub mod logging;
pub mod metrics;

pub use metrics::MetricsObserver;
