//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure: listeners, the
//! options every server handle is created with, outbound pool options and
//! observability. All types derive Serde traits for deserialization from
//! config files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::address::SocketAddress;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PortshareConfig {
    /// Listeners to bind at startup.
    pub listeners: Vec<ListenerConfig>,

    /// Outbound connection pool settings.
    pub client: PoolOptions,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl PortshareConfig {
    pub fn listener(&self, name: &str) -> Option<&ListenerConfig> {
        self.listeners.iter().find(|l| l.name == name)
    }

    /// Every PEM file referenced by a TLS-enabled listener.
    pub fn pem_paths(&self) -> Vec<PathBuf> {
        self.listeners
            .iter()
            .filter(|l| l.options.ssl)
            .flat_map(|l| l.options.tls.pem_paths())
            .map(Path::to_path_buf)
            .collect()
    }
}

/// Protocol spoken on a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Raw TCP (echo handler in the bundled binary).
    Tcp,
    /// HTTP/1.1 and HTTP/2.
    #[default]
    Http,
}

/// A listener: one address bound by `instances` logical handles.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Listener identifier for logging.
    pub name: String,

    /// Bind address: `host:port` or `unix:/path`.
    pub address: SocketAddress,

    pub protocol: Protocol,

    /// Number of logical handles sharing the physical listener.
    pub instances: usize,

    #[serde(flatten)]
    pub options: ServerOptions,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            address: SocketAddress::inet("0.0.0.0", 8080),
            protocol: Protocol::Http,
            instances: 1,
            options: ServerOptions::default(),
        }
    }
}

/// Options a server handle is created with.
///
/// Only the handle that ends up owning the physical listener applies TLS,
/// traffic shaping and the connection limit; joiners inherit the owner's.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Enable TLS on accepted connections.
    pub ssl: bool,

    /// TLS material and negotiation settings.
    pub tls: TlsOptions,

    /// Optional global bandwidth limits.
    pub traffic_shaping: Option<TrafficShapingOptions>,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// TLS handshake timeout in seconds.
    pub handshake_timeout_secs: u64,
}

impl ServerOptions {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            ssl: false,
            tls: TlsOptions::default(),
            traffic_shaping: None,
            max_connections: 10_000,
            handshake_timeout_secs: 10,
        }
    }
}

/// Where PEM content comes from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PemSource {
    /// Read from a file at resolution time.
    Path(PathBuf),
    /// PEM text embedded in the configuration.
    Inline(String),
}

impl PemSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            PemSource::Path(path) => Some(path),
            PemSource::Inline(_) => None,
        }
    }
}

/// One certificate chain and its private key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct KeyCertOptions {
    pub cert: PemSource,
    pub key: PemSource,

    /// Server name this pair answers for when SNI is enabled.
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Trust anchors used to verify client certificates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TrustOptions {
    pub ca: PemSource,
}

/// Client certificate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuth {
    #[default]
    None,
    /// Ask for a certificate, accept clients without one.
    Request,
    /// Reject clients without a valid certificate.
    Required,
}

/// TLS configuration for a listener.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TlsOptions {
    pub key_certs: Vec<KeyCertOptions>,

    pub trust: Option<TrustOptions>,

    /// Select the key/certificate pair by the client's SNI name.
    pub sni: bool,

    pub client_auth: ClientAuth,

    /// ALPN protocols in preference order (e.g. `["h2", "http/1.1"]`).
    pub alpn_protocols: Vec<String>,
}

impl TlsOptions {
    /// True when any key/certificate or trust material is configured.
    pub fn has_credentials(&self) -> bool {
        !self.key_certs.is_empty() || self.trust.is_some()
    }

    /// Files this configuration reads when resolved.
    pub fn pem_paths(&self) -> impl Iterator<Item = &Path> {
        self.key_certs
            .iter()
            .flat_map(|kc| [kc.cert.path(), kc.key.path()])
            .chain(self.trust.iter().map(|t| t.ca.path()))
            .flatten()
    }
}

/// Global traffic shaping for one physical listener.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TrafficShapingOptions {
    /// Inbound bytes per second, `0` for unlimited.
    pub inbound_global_bandwidth: u64,

    /// Outbound bytes per second, `0` for unlimited.
    pub outbound_global_bandwidth: u64,

    /// Outbound burst allowance in bytes, `0` to use one second of bandwidth.
    pub peak_outbound_global_bandwidth: u64,

    /// Interval between throughput statistics snapshots in milliseconds.
    pub check_interval_for_stats_ms: u64,

    /// Upper bound on a single throttling delay in milliseconds.
    pub max_delay_to_wait_ms: u64,
}

impl Default for TrafficShapingOptions {
    fn default() -> Self {
        Self {
            inbound_global_bandwidth: 0,
            outbound_global_bandwidth: 0,
            peak_outbound_global_bandwidth: 0,
            check_interval_for_stats_ms: 1_000,
            max_delay_to_wait_ms: 15_000,
        }
    }
}

/// Outbound connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Maximum connections per endpoint.
    pub max_pool_size: usize,

    /// Maximum queued lease requests per endpoint, `None` for unbounded.
    pub max_wait_queue_size: Option<usize>,

    /// Idle connections older than this are closed, in seconds.
    pub keep_alive_timeout_secs: u64,

    /// Interval of the idle-endpoint cleaner in milliseconds, `0` disables it.
    pub pool_cleaner_period_ms: u64,

    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Default request timeout in milliseconds, `0` for none.
    pub request_timeout_ms: u64,
}

impl PoolOptions {
    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn pool_cleaner_period(&self) -> Option<Duration> {
        (self.pool_cleaner_period_ms > 0).then(|| Duration::from_millis(self.pool_cleaner_period_ms))
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_pool_size: 5,
            max_wait_queue_size: None,
            keep_alive_timeout_secs: 60,
            pool_cleaner_period_ms: 1_000,
            connect_timeout_secs: 60,
            request_timeout_ms: 0,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
