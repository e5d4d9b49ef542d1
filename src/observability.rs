use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramOpts, HistogramVec, IntCounterVec,
};

use crate::breaker::CircuitState;

const DEFAULT_BUCKETS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0, 30000.0,
    60000.0,
];

// Responses sent, by status code
static REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_requests_total",
        "The total number of client requests answered by the gateway",
        &["code"]
    )
    .unwrap()
});

// Requests refused before reaching an upstream
static REJECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_rejections_total",
        "Requests rejected by the gateway, by error code",
        &["reason"]
    )
    .unwrap()
});

static UPSTREAM_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "gateway_upstream_latency_ms",
        "Upstream call latency in milliseconds per service",
    )
    .buckets(DEFAULT_BUCKETS.to_vec());
    register_histogram_vec!(opts, &["service", "code"]).unwrap()
});

static CIRCUIT_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_circuit_transitions_total",
        "Circuit breaker state changes per service",
        &["service", "state"]
    )
    .unwrap()
});

pub fn record_request(code: u16) {
    REQUESTS.with_label_values(&[code.to_string().as_str()]).inc();
}

pub fn record_rejection(reason: &str) {
    REJECTIONS.with_label_values(&[reason]).inc();
}

/// One latency+status sample per proxied call. `code` is empty when the
/// upstream never answered.
pub fn record_upstream(service: &str, code: &str, latency_ms: f64) {
    UPSTREAM_LATENCY
        .with_label_values(&[service, code])
        .observe(latency_ms);
}

pub fn record_transition(service: &str, state: CircuitState) {
    CIRCUIT_TRANSITIONS
        .with_label_values(&[service, state.as_str()])
        .inc();
}
