//! # Metrics Collection
//!
//! Counters, gauges and histograms for plugin and lease activity. Recording
//! is always on; without an installed recorder the macros are no-ops.

use crate::config::ObservabilityConfig;
use crate::errors::Result;
use ::tracing::{info, warn};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Install the Prometheus exporter and describe every metric
pub async fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(address) = config.metrics_bind_address() else {
        return Ok(());
    };

    #[cfg(feature = "prometheus")]
    {
        use crate::errors::WardenError;
        use metrics_exporter_prometheus::PrometheusBuilder;
        use std::net::SocketAddr;

        let socket: SocketAddr = address.parse().map_err(|e| {
            WardenError::config(format!("Invalid metrics address '{}': {}", address, e))
        })?;

        PrometheusBuilder::new().with_http_listener(socket).install().map_err(|e| {
            WardenError::config(format!("Failed to install Prometheus exporter: {}", e))
        })?;

        info!(address = %socket, "Prometheus metrics exporter listening");
    }

    #[cfg(not(feature = "prometheus"))]
    warn!(address = %address, "Metrics enabled but the prometheus feature is not compiled in");

    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_counter!("warden_leases_created_total", "Leases registered with the expiration manager");
    describe_counter!("warden_leases_renewed_total", "Successful lease renewals");
    describe_counter!("warden_leases_revoked_total", "Leases removed, labelled by how");
    describe_counter!("warden_revocation_failures_total", "Failed revocation attempts");
    describe_gauge!("warden_irrevocable_leases", "Leases whose revocation permanently failed");
    describe_counter!("warden_plugin_spawns_total", "Plugin processes started");
    describe_counter!("warden_plugin_closes_total", "Plugin processes torn down");
    describe_counter!("warden_rpc_calls_total", "Calls across the plugin boundary");
    describe_histogram!("warden_rpc_call_duration_seconds", "Latency of plugin boundary calls");
    info!("Metrics described");
}

/// Record a lease registration
pub fn record_lease_created(mount: &str) {
    let labels = [("mount", mount.to_string())];
    counter!("warden_leases_created_total", &labels).increment(1);
}

/// Record a lease renewal
pub fn record_lease_renewed(mount: &str) {
    let labels = [("mount", mount.to_string())];
    counter!("warden_leases_renewed_total", &labels).increment(1);
}

/// Record a lease removal (`expired`, `revoked`, `forced`)
pub fn record_lease_revoked(mount: &str, reason: &str) {
    let labels = [("mount", mount.to_string()), ("reason", reason.to_string())];
    counter!("warden_leases_revoked_total", &labels).increment(1);
}

/// Record a failed revocation attempt
pub fn record_revocation_failure(mount: &str, terminal: bool) {
    let labels = [("mount", mount.to_string()), ("terminal", terminal.to_string())];
    counter!("warden_revocation_failures_total", &labels).increment(1);
}

/// Update the irrevocable lease gauge
pub fn set_irrevocable_leases(count: usize) {
    gauge!("warden_irrevocable_leases").set(count as f64);
}

/// Record a plugin process spawn
pub fn record_plugin_spawn(plugin: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    let labels = [("plugin", plugin.to_string()), ("status", status.to_string())];
    counter!("warden_plugin_spawns_total", &labels).increment(1);
}

/// Record a plugin process teardown
pub fn record_plugin_close(plugin: &str, forced: bool) {
    let labels = [("plugin", plugin.to_string()), ("forced", forced.to_string())];
    counter!("warden_plugin_closes_total", &labels).increment(1);
}

/// Record a call across the plugin boundary with its latency
pub fn record_rpc_call(service: &str, method: &str, success: bool, duration: f64) {
    let status = if success { "success" } else { "error" };
    let labels = [
        ("service", service.to_string()),
        ("method", method.to_string()),
        ("status", status.to_string()),
    ];
    counter!("warden_rpc_calls_total", &labels).increment(1);

    let duration_labels = [("service", service.to_string()), ("method", method.to_string())];
    histogram!("warden_rpc_call_duration_seconds", &duration_labels).record(duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_metrics_disabled() {
        let config = ObservabilityConfig { enable_metrics: false, ..Default::default() };
        assert!(init_metrics(&config).await.is_ok());
    }

    #[test]
    fn test_recording_without_recorder() {
        // No recorder installed: recording must be a no-op rather than a panic
        record_lease_created("database/");
        record_lease_revoked("database/", "expired");
        record_revocation_failure("database/", true);
        set_irrevocable_leases(3);
        record_rpc_call("backend", "new_user", true, 0.002);
    }
}
