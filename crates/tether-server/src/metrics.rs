//! Prometheus recorder and HTTP-surface metric names.
//!
//! Relay-level names (calls, sessions, bus) live in `tether_relay::metrics`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the global Prometheus recorder.
///
/// Call once at startup, before anything records.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|error| ServerError::Metrics(error.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Prometheus text exposition.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Caller API requests (counter, labels: route, status).
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
/// Caller API latency (histogram, labels: route).
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
/// Agent sockets accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Agent sockets closed (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Agent upgrades refused (counter, labels: reason).
pub const WS_REJECTED_TOTAL: &str = "ws_rejected_total";
/// Agent socket lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Agent sockets closed by the liveness watchdog (counter).
pub const WS_LIVENESS_TIMEOUTS_TOTAL: &str = "ws_liveness_timeouts_total";
