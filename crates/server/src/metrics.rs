//! Prometheus metrics for the module proxy.
//!
//! Exposes request counts by operation and outcome, and request latency.
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! Labels carry no module paths, only the protocol operation.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};
use std::time::Instant;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "modproxy_requests_total",
            "Total number of module proxy requests by operation and outcome",
        ),
        &["operation", "outcome"],
    )
    .expect("metric creation failed")
});

pub static REQUEST_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "modproxy_request_duration_seconds",
            "Time taken to produce the response head for a module proxy request",
        )
        .buckets(vec![
            0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
        ]),
        &["operation"],
    )
    .expect("metric creation failed")
});

pub static REQUESTS_IN_FLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "modproxy_requests_in_flight",
        "Number of module proxy requests currently being resolved",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so tests can build as many routers as they like.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(REQUESTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REQUEST_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REQUESTS_IN_FLIGHT.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Tracks one request from dispatch until [`RequestTimer::finish`].
///
/// A timer dropped without finishing (the client went away) is counted
/// with outcome `cancelled`.
pub struct RequestTimer {
    operation: &'static str,
    started: Instant,
    finished: bool,
}

impl RequestTimer {
    pub fn start(operation: &'static str) -> Self {
        REQUESTS_IN_FLIGHT.inc();
        Self {
            operation,
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn finish(mut self, status: StatusCode) {
        self.record(outcome(status));
    }

    fn record(&mut self, outcome: &str) {
        self.finished = true;
        REQUESTS_IN_FLIGHT.dec();
        REQUESTS
            .with_label_values(&[self.operation, outcome])
            .inc();
        REQUEST_DURATION
            .with_label_values(&[self.operation])
            .observe(self.started.elapsed().as_secs_f64());
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        if !self.finished {
            self.record("cancelled");
        }
    }
}

fn outcome(status: StatusCode) -> &'static str {
    match status {
        s if s.is_success() => "ok",
        StatusCode::NOT_FOUND | StatusCode::GONE => "not_found",
        StatusCode::GATEWAY_TIMEOUT => "timeout",
        s if s.is_client_error() => "bad_request",
        _ => "error",
    }
}
