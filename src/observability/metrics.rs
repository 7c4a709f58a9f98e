//! Metrics collection and exposition.
//!
//! # Metrics
//! - `transport_connections_accepted_total` (counter): accepted connections by connector
//! - `transport_connections_active` (gauge): live connections by connector
//! - `transport_bind_total` (counter): bind attempts by connector and outcome
//! - `transport_pool_acquire_total` (counter): pool acquires by endpoint, reused or new
//! - `transport_pool_discarded_total` (counter): pooled connections closed, by reason
//! - `transport_pool_idle_connections` (gauge): idle connections by endpoint

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with an HTTP scrape listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_opened(connector_id: &str, active: u64) {
    counter!("transport_connections_accepted_total", "connector" => connector_id.to_string())
        .increment(1);
    gauge!("transport_connections_active", "connector" => connector_id.to_string()).set(active as f64);
}

pub fn record_connection_closed(connector_id: &str, active: u64) {
    gauge!("transport_connections_active", "connector" => connector_id.to_string()).set(active as f64);
}

pub fn record_bind(connector_id: &str, success: bool) {
    let outcome = if success { "bound" } else { "failed" };
    counter!("transport_bind_total", "connector" => connector_id.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn record_pool_acquire(endpoint: &str, reused: bool) {
    let reused = if reused { "true" } else { "false" };
    counter!("transport_pool_acquire_total", "endpoint" => endpoint.to_string(), "reused" => reused)
        .increment(1);
}

pub fn record_pool_discard(endpoint: &str, reason: &'static str) {
    counter!("transport_pool_discarded_total", "endpoint" => endpoint.to_string(), "reason" => reason)
        .increment(1);
}

pub fn record_pool_idle(endpoint: &str, idle: usize) {
    gauge!("transport_pool_idle_connections", "endpoint" => endpoint.to_string()).set(idle as f64);
}
