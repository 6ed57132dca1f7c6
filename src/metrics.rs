use axum::{body::Body, http::Request, response::Response};
use lazy_static::lazy_static;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};
use tracing::Span;

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Simple request counter
    pub static ref INCOMING_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("incoming_requests", "The number of HTTP requests received"),
        &["http_method"]
    ).unwrap();
    // Request counter by status code
    pub static ref RESPONSE_CODE_COLLECTOR: IntCounterVec = IntCounterVec::new(
        Opts::new("outgoing_response", "The number of responses sent."),
        &["status_code"]
    ).unwrap();
    // Request histogram by response time
    pub static ref RESPONSE_TIME_COLLECTOR: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("response_time", "The time taken to respond to each request"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
        },
        &[],
    ).unwrap();
    // Operator invocations by operator and final status
    pub static ref OPERATOR_INVOCATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("operator_invocations", "The number of operator invocations"),
        &["operator", "status"]
    ).unwrap();
    // Time spent by each worker in each lifecycle phase
    pub static ref PHASE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("phase_duration", "The time a worker spends in a lifecycle phase"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
        },
        &["phase"],
    ).unwrap();
    // Fragments written by operator workers
    pub static ref FRAGMENTS_WRITTEN: IntCounter = IntCounter::new(
        "fragments_written", "The number of fragments written to storage"
    ).unwrap();
    // Invocations rolled back after a failure
    pub static ref ROLLBACKS: IntCounterVec = IntCounterVec::new(
        Opts::new("rollbacks", "The number of operator invocations rolled back"),
        &["operator"]
    ).unwrap();
}

pub fn register_metrics() {
    REGISTRY
        .register(Box::new(INCOMING_REQUESTS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESPONSE_CODE_COLLECTOR.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESPONSE_TIME_COLLECTOR.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(OPERATOR_INVOCATIONS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PHASE_DURATION.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(FRAGMENTS_WRITTEN.clone()))
        .unwrap();
    REGISTRY.register(Box::new(ROLLBACKS.clone())).unwrap();
}

pub async fn metrics_handler() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("failed to encode metrics: {err}");
    }

    String::from_utf8_lossy(&buffer).into_owned()
}

/// Increments the prometheus counter on all incoming requests, labelled by http method
pub fn request_counter(request: &Request<Body>, _span: &Span) {
    INCOMING_REQUESTS
        .with_label_values(&[&request.method().to_string().to_ascii_uppercase()])
        .inc();
}

/// Increment the prometheus counter on all outgoing responses, labelled by status code
pub fn record_response_metrics<B>(
    response: &Response<B>,
    latency: std::time::Duration,
    _span: &Span,
) {
    RESPONSE_CODE_COLLECTOR
        .with_label_values(&[response.status().as_str()])
        .inc();

    RESPONSE_TIME_COLLECTOR
        .with_label_values(&[])
        .observe(latency.as_secs_f64());
}
