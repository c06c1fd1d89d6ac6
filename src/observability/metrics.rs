//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define listener, TLS, pool and request metrics
//! - Expose Prometheus-compatible metrics endpoint
//! - Feed per-endpoint request metrics from the pool observer hooks
//!
//! # Metrics
//! - `portshare_connections_accepted_total` (counter): by listener
//! - `portshare_listeners_active` (gauge): bound physical listeners
//! - `portshare_tls_updates_total` (counter): by outcome
//! - `portshare_tls_handshake_failures_total` (counter): by listener
//! - `portshare_traffic_bytes_per_second` (gauge): by listener, direction
//! - `portshare_pool_connects_total` (counter): by endpoint, status
//! - `portshare_pool_expired_total` (counter): idle connections closed
//! - `portshare_requests_total` (counter): observed requests by endpoint
//! - `portshare_response_duration_seconds` (histogram): by endpoint
//! - `portshare_request_timeouts_total` (counter): by authority
//!
//! # Design Decisions
//! - Without an installed recorder every call is a no-op
//! - Labels are listener addresses and endpoint servers, never request data

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::pool::lookup::{EndpointObserver, ObserverError, RequestToken};

/// Install the Prometheus recorder with its scrape listener on `address`.
pub fn init_metrics(address: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(address).install()?;
    tracing::info!(address = %address, "Metrics endpoint started");
    Ok(())
}

pub fn record_connection_accepted(listener: &str) {
    counter!("portshare_connections_accepted_total", "listener" => listener.to_string()).increment(1);
}

pub fn record_listener_bound(listener: &str) {
    counter!("portshare_listener_binds_total", "listener" => listener.to_string()).increment(1);
    gauge!("portshare_listeners_active").increment(1.0);
}

pub fn record_listener_closed(listener: &str) {
    counter!("portshare_listener_closes_total", "listener" => listener.to_string()).increment(1);
    gauge!("portshare_listeners_active").decrement(1.0);
}

/// `outcome` is one of `installed`, `superseded` or `failed`.
pub fn record_tls_update(outcome: &'static str) {
    counter!("portshare_tls_updates_total", "outcome" => outcome).increment(1);
}

pub fn record_handshake_failure(listener: &str) {
    counter!("portshare_tls_handshake_failures_total", "listener" => listener.to_string()).increment(1);
}

/// Bytes per second observed over the last stats interval.
pub fn record_throughput(listener: &str, inbound: f64, outbound: f64) {
    gauge!("portshare_traffic_bytes_per_second", "listener" => listener.to_string(), "direction" => "inbound")
        .set(inbound);
    gauge!("portshare_traffic_bytes_per_second", "listener" => listener.to_string(), "direction" => "outbound")
        .set(outbound);
}

pub fn record_pool_connect(endpoint: &str, success: bool) {
    let status = if success { "ok" } else { "error" };
    counter!("portshare_pool_connects_total", "endpoint" => endpoint.to_string(), "status" => status).increment(1);
}

pub fn record_pool_expired(endpoint: &str, count: usize) {
    counter!("portshare_pool_expired_total", "endpoint" => endpoint.to_string()).increment(count as u64);
}

pub fn record_request_timeout(authority: &str) {
    counter!("portshare_request_timeouts_total", "authority" => authority.to_string()).increment(1);
}

/// Pool observer reporting request counts and response latency.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsObserver;

impl EndpointObserver for MetricsObserver {
    fn request_begin(&self, token: &RequestToken) -> Result<(), ObserverError> {
        counter!("portshare_requests_total", "endpoint" => token.endpoint.clone()).increment(1);
        Ok(())
    }

    fn response_end(&self, token: &RequestToken) -> Result<(), ObserverError> {
        histogram!("portshare_response_duration_seconds", "endpoint" => token.endpoint.clone())
            .record(token.started.elapsed().as_secs_f64());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_connection_accepted("127.0.0.1:8080");
        record_tls_update("installed");
        record_throughput("127.0.0.1:8080", 10.0, 20.0);
        record_pool_expired("10.0.0.1:80", 3);
    }

    #[test]
    fn observer_never_fails() {
        let token = RequestToken {
            id: uuid::Uuid::new_v4(),
            started: tokio::time::Instant::now(),
            endpoint: "10.0.0.1:80".into(),
        };
        assert!(MetricsObserver.request_begin(&token).is_ok());
        assert!(MetricsObserver.response_end(&token).is_ok());
    }
}
