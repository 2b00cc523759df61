//! Metrics collection for usage-service.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    });
}

/// Get metrics output in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

/// Record an authorization outcome (`allowed`, `denied`, `error`).
pub fn record_quota_decision(resource: &str, outcome: &'static str) {
    metrics::counter!(
        "usage_quota_decisions_total",
        "resource" => resource.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record the amount granted by successful authorizations.
pub fn record_units_consumed(resource: &str, amount: u64) {
    metrics::counter!("usage_units_consumed_total", "resource" => resource.to_string())
        .increment(amount);
}

/// Record a refund attempt outcome (`applied`, `failed`).
pub fn record_refund(resource: &str, status: &'static str) {
    metrics::counter!(
        "usage_refunds_total",
        "resource" => resource.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a window reset. `trigger` is `lazy`, `explicit` or `tier_change`.
pub fn record_window_reset(window: &'static str, trigger: &'static str) {
    metrics::counter!(
        "usage_window_resets_total",
        "window" => window,
        "trigger" => trigger
    )
    .increment(1);
}

pub fn record_store_error(operation: &'static str) {
    metrics::counter!("usage_store_errors_total", "operation" => operation).increment(1);
}

pub fn record_sweep(removed: usize) {
    metrics::counter!("usage_sweep_runs_total").increment(1);
    metrics::counter!("usage_sweep_removed_total").increment(removed as u64);
}
