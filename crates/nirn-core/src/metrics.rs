//! Prometheus metrics for the proxy.
//!
//! Exposed series:
//! - `nirn_proxy_requests` — request duration histogram labeled
//!   `{method, status, route, clientId}`; 429s with a shared scope are
//!   reported as status `429 Shared`.
//! - `nirn_proxy_open_connections` — gauge of in-flight client requests.
//! - `nirn_proxy_requests_routed_sent` / `_received` / `_error` — cluster
//!   routing counters.
//! - `nirn_proxy_error` — count of error-level dispositions.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

pub const REQUESTS: &str = "nirn_proxy_requests";
pub const OPEN_CONNECTIONS: &str = "nirn_proxy_open_connections";
pub const ROUTED_SENT: &str = "nirn_proxy_requests_routed_sent";
pub const ROUTED_RECEIVED: &str = "nirn_proxy_requests_routed_received";
pub const ROUTED_ERROR: &str = "nirn_proxy_requests_routed_error";
pub const ERRORS: &str = "nirn_proxy_error";

/// Install the Prometheus recorder with an HTTP listener on `addr`.
/// Must run inside a tokio runtime; call once at startup.
pub fn install(addr: SocketAddr) -> Result<(), crate::error::ProxyError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| crate::error::ProxyError::Config(format!("metrics exporter: {e}")))?;

    describe_histogram!(REQUESTS, "Histogram of proxied request durations");
    describe_gauge!(OPEN_CONNECTIONS, "Number of in-flight client requests");
    describe_counter!(ROUTED_SENT, "Requests routed to other cluster nodes");
    describe_counter!(ROUTED_RECEIVED, "Requests received from other cluster nodes");
    describe_counter!(ROUTED_ERROR, "Errors while routing requests to other nodes");
    describe_counter!(ERRORS, "Errors while processing requests");
    Ok(())
}

/// Observe one completed upstream request.
pub fn observe_request(
    method: &str,
    status: String,
    route: String,
    client_id: String,
    elapsed: Duration,
) {
    histogram!(
        REQUESTS,
        "method" => method.to_string(),
        "status" => status,
        "route" => route,
        "clientId" => client_id,
    )
    .record(elapsed.as_secs_f64());
}

pub fn inc_open_connections() {
    gauge!(OPEN_CONNECTIONS).increment(1.0);
}

pub fn dec_open_connections() {
    gauge!(OPEN_CONNECTIONS).decrement(1.0);
}

pub fn inc_routed_sent() {
    counter!(ROUTED_SENT).increment(1);
}

pub fn inc_routed_received() {
    counter!(ROUTED_RECEIVED).increment(1);
}

pub fn inc_routed_error() {
    counter!(ROUTED_ERROR).increment(1);
}

pub fn inc_error() {
    counter!(ERRORS).increment(1);
}
