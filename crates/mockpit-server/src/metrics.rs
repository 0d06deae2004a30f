//! Prometheus metrics for mockpit.
//!
//! Tracks served requests, proxied requests, callback invocations, template
//! failures and response latency.
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    /// Total number of requests answered
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "mockpit_requests_total",
        "Total number of requests answered by mock environments",
        &["method", "status"]
    )
    .unwrap();

    /// Requests forwarded to the proxy host
    pub static ref PROXIED_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "mockpit_proxied_requests_total",
        "Total number of requests forwarded to the proxy host",
        &["status"]  // upstream status, or "error"
    )
    .unwrap();

    /// Callback invocations
    pub static ref CALLBACKS_TOTAL: CounterVec = register_counter_vec!(
        "mockpit_callbacks_total",
        "Total number of callback invocations",
        &["result"]  // result: success|error|cancelled
    )
    .unwrap();

    /// Template rendering failures
    pub static ref TEMPLATE_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "mockpit_template_errors_total",
        "Total number of template rendering failures",
        &["source"]  // source: body|header|file|callback
    )
    .unwrap();

    /// Time from request arrival to response, including artificial latency
    pub static ref RESPONSE_LATENCY_MS: HistogramVec = register_histogram_vec!(
        "mockpit_response_latency_ms",
        "Histogram of response latency in milliseconds",
        &["method"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

pub fn record_request(method: &str, status: u16, duration_ms: f64) {
    REQUESTS_TOTAL
        .with_label_values(&[method, &status.to_string()])
        .inc();
    RESPONSE_LATENCY_MS
        .with_label_values(&[method])
        .observe(duration_ms);
}

/// `status` is `None` when the upstream could not be reached.
pub fn record_proxied(status: Option<u16>) {
    let label = status.map_or_else(|| "error".to_string(), |s| s.to_string());
    PROXIED_REQUESTS_TOTAL.with_label_values(&[&label]).inc();
}

pub fn record_callback(result: &str) {
    CALLBACKS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_template_error(source: &str) {
    TEMPLATE_ERRORS_TOTAL.with_label_values(&[source]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collection() {
        record_request("GET", 200, 12.0);
        record_proxied(Some(502));
        record_proxied(None);
        record_callback("success");
        record_template_error("body");

        let metrics = collect_metrics();
        assert!(metrics.contains("mockpit_requests_total"));
        assert!(metrics.contains("mockpit_proxied_requests_total"));
        assert!(metrics.contains("mockpit_callbacks_total"));
        assert!(metrics.contains("mockpit_template_errors_total"));
        assert!(metrics.contains("mockpit_response_latency_ms"));
    }
}
