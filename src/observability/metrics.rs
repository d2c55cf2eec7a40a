//! Metrics collection and exposition.
//!
//! # Metrics
//! - `protector_decisions_total` (counter): gate decisions by `decision`
//! - `protector_threats_total` (counter): detections by `category`
//! - `protector_persistence_failures_total` (counter): by `kind`
//! - `protector_persistence_dropped_total` (counter): threat events shed on a full queue
//! - `protector_active_identities` (gauge): identities with a live rate window

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_decision(decision: &'static str) {
    ::metrics::counter!("protector_decisions_total", "decision" => decision).increment(1);
}

pub fn record_threat(category: &str) {
    ::metrics::counter!("protector_threats_total", "category" => category.to_string()).increment(1);
}

pub fn record_persistence_failure(kind: &'static str) {
    ::metrics::counter!("protector_persistence_failures_total", "kind" => kind).increment(1);
}

pub fn record_persistence_dropped() {
    ::metrics::counter!("protector_persistence_dropped_total").increment(1);
}

pub fn set_active_identities(count: usize) {
    ::metrics::gauge!("protector_active_identities").set(count as f64);
}
