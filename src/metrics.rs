use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, TextEncoder, register_counter, register_histogram};

lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("gateway_requests_total", "Total number of upstream requests").unwrap();
    pub static ref REQUEST_FAILURES: Counter =
        register_counter!("gateway_request_failures_total", "Requests that ended in an error").unwrap();
    pub static ref REQUEST_RETRIES: Counter =
        register_counter!("gateway_request_retries_total", "Requests retried after a token refresh").unwrap();
    pub static ref TOKEN_REFRESHES: Counter =
        register_counter!("gateway_token_refreshes_total", "Token refresh calls issued").unwrap();
    pub static ref TOKEN_REFRESH_FAILURES: Counter =
        register_counter!("gateway_token_refresh_failures_total", "Token refresh calls that failed").unwrap();
    pub static ref CREDENTIALS_CLEARED: Counter =
        register_counter!("gateway_credentials_cleared_total", "Times the session was wiped after a terminal auth failure").unwrap();
    pub static ref ATTEMPTS_BLOCKED: Counter =
        register_counter!("gateway_attempts_blocked_total", "Actions refused by an attempt limiter").unwrap();
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "gateway_request_latency_seconds",
        "Upstream request latency in seconds"
    )
    .unwrap();
}

/// Prometheus text exposition of every registered metric.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
