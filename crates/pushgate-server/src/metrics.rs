//! Prometheus metrics recorder and metric name constants.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Connections accepted total (counter).
pub const CONNECTIONS_TOTAL: &str = "gateway_connections_total";
/// Connection teardowns total (counter).
pub const DISCONNECTIONS_TOTAL: &str = "gateway_disconnections_total";
/// Last-flushed online connections (gauge).
pub const ONLINE_CONNECTIONS: &str = "gateway_online_connections";
/// Enqueues refused by queue backpressure (counter).
pub const QUEUE_FULL_TOTAL: &str = "gateway_queue_full_total";
/// Per-connection broadcast send failures (counter).
pub const BROADCAST_FAILURES_TOTAL: &str = "gateway_broadcast_failures_total";
/// Duplicate-login evictions (counter).
pub const EVICTIONS_TOTAL: &str = "gateway_duplicate_evictions_total";
/// Outbound writes slower than the degraded-network threshold (counter).
pub const DEGRADED_WRITES_TOTAL: &str = "gateway_degraded_writes_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_render() {
        // Build a recorder + handle (no global install to avoid test conflicts).
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            CONNECTIONS_TOTAL,
            DISCONNECTIONS_TOTAL,
            ONLINE_CONNECTIONS,
            QUEUE_FULL_TOTAL,
            BROADCAST_FAILURES_TOTAL,
            EVICTIONS_TOTAL,
            DEGRADED_WRITES_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
