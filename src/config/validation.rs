//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check listener names are unique and TLS settings are complete
//! - Validate value ranges (ports, instance counts, limits, intervals)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: PortshareConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{ClientAuth, ListenerConfig, PortshareConfig};
use crate::net::address::SocketAddress;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// One semantic problem, located by a dotted field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &PortshareConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut names = HashSet::new();
    for (i, listener) in config.listeners.iter().enumerate() {
        let field = format!("listeners[{i}]");
        if !names.insert(listener.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{field}.name"),
                format!("duplicate listener name '{}'", listener.name),
            ));
        }
        validate_listener(&field, listener, &mut errors);
    }

    if config.client.max_pool_size == 0 {
        errors.push(ValidationError::new("client.max_pool_size", "must be at least 1"));
    }

    let observability = &config.observability;
    if !LOG_LEVELS.contains(&observability.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level '{}'", observability.log_level),
        ));
    }
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_listener(field: &str, listener: &ListenerConfig, errors: &mut Vec<ValidationError>) {
    if listener.name.trim().is_empty() {
        errors.push(ValidationError::new(format!("{field}.name"), "must not be empty"));
    }

    match &listener.address {
        SocketAddress::Inet { host, port } => {
            if host.is_empty() {
                errors.push(ValidationError::new(format!("{field}.address"), "host must not be empty"));
            }
            if *port > i32::from(u16::MAX) {
                errors.push(ValidationError::new(
                    format!("{field}.address"),
                    format!("port {port} is out of range"),
                ));
            }
        }
        SocketAddress::DomainSocket { path } => {
            if path.as_os_str().is_empty() {
                errors.push(ValidationError::new(format!("{field}.address"), "socket path must not be empty"));
            }
        }
    }

    if listener.instances == 0 {
        errors.push(ValidationError::new(format!("{field}.instances"), "must be at least 1"));
    }

    let options = &listener.options;
    if options.max_connections == 0 {
        errors.push(ValidationError::new(format!("{field}.max_connections"), "must be at least 1"));
    }

    if options.ssl {
        if options.tls.key_certs.is_empty() {
            errors.push(ValidationError::new(
                format!("{field}.tls.key_certs"),
                "ssl requires at least one certificate",
            ));
        }
        if options.handshake_timeout_secs == 0 {
            errors.push(ValidationError::new(
                format!("{field}.handshake_timeout_secs"),
                "must be greater than 0",
            ));
        }
        if options.tls.client_auth != ClientAuth::None && options.tls.trust.is_none() {
            errors.push(ValidationError::new(
                format!("{field}.tls.trust"),
                "client authentication requires trust roots",
            ));
        }
        if options.tls.sni && options.tls.key_certs.iter().all(|kc| kc.server_name.is_none()) {
            errors.push(ValidationError::new(
                format!("{field}.tls.sni"),
                "sni requires a server_name on at least one certificate",
            ));
        }
    }

    if let Some(shaping) = &options.traffic_shaping {
        if shaping.check_interval_for_stats_ms == 0 {
            errors.push(ValidationError::new(
                format!("{field}.traffic_shaping.check_interval_for_stats_ms"),
                "must be greater than 0",
            ));
        }
        if shaping.peak_outbound_global_bandwidth != 0
            && shaping.peak_outbound_global_bandwidth < shaping.outbound_global_bandwidth
        {
            errors.push(ValidationError::new(
                format!("{field}.traffic_shaping.peak_outbound_global_bandwidth"),
                "must not be below outbound_global_bandwidth",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{KeyCertOptions, PemSource, TrafficShapingOptions};

    fn listener(name: &str) -> ListenerConfig {
        ListenerConfig {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&PortshareConfig::default()).is_ok());
        let config = PortshareConfig {
            listeners: vec![listener("a"), listener("b")],
            ..Default::default()
        };
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut tls = listener("a");
        tls.options.ssl = true;
        tls.options.tls.client_auth = ClientAuth::Required;
        let mut bad = listener("a");
        bad.address = SocketAddress::inet("localhost", 70000);
        bad.instances = 0;

        let mut config = PortshareConfig {
            listeners: vec![tls, bad],
            ..Default::default()
        };
        config.client.max_pool_size = 0;
        config.observability.log_level = "loud".into();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "listeners[0].tls.key_certs",
                "listeners[0].tls.trust",
                "listeners[1].name",
                "listeners[1].address",
                "listeners[1].instances",
                "client.max_pool_size",
                "observability.log_level",
            ]
        );
    }

    #[test]
    fn negative_ports_and_sni_names() {
        let mut group = listener("group");
        group.address = SocketAddress::inet("localhost", -3);
        group.options.ssl = true;
        group.options.tls.sni = true;
        group.options.tls.key_certs.push(KeyCertOptions {
            cert: PemSource::Path("a.crt".into()),
            key: PemSource::Path("a.key".into()),
            server_name: None,
        });
        let config = PortshareConfig {
            listeners: vec![group],
            ..Default::default()
        };
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "listeners[0].tls.sni");
    }

    #[test]
    fn traffic_shaping_ranges() {
        let mut shaped = listener("s");
        shaped.options.traffic_shaping = Some(TrafficShapingOptions {
            outbound_global_bandwidth: 1000,
            peak_outbound_global_bandwidth: 500,
            check_interval_for_stats_ms: 0,
            ..Default::default()
        });
        let config = PortshareConfig {
            listeners: vec![shaped],
            ..Default::default()
        };
        assert_eq!(validate_config(&config).unwrap_err().len(), 2);
    }
}
