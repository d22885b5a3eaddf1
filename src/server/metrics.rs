use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all mastering server metrics
const PREFIX: &str = "mastering";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Request Metrics
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Job Metrics
    pub static ref JOBS_SUBMITTED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_jobs_submitted_total"),
        "Total mastering jobs submitted"
    ).expect("Failed to create jobs_submitted_total metric");

    pub static ref JOBS_FINISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_finished_total"), "Mastering jobs by terminal status"),
        &["status"]
    ).expect("Failed to create jobs_finished_total metric");

    pub static ref JOBS_RUNNING: Gauge = Gauge::new(
        format!("{PREFIX}_jobs_running"),
        "Mastering jobs currently holding a worker slot"
    ).expect("Failed to create jobs_running metric");

    pub static ref JOB_PROCESSING_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            format!("{PREFIX}_job_processing_duration_seconds"),
            "Time from processing start to terminal status"
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0])
    ).expect("Failed to create job_processing_duration_seconds metric");

    pub static ref TIER_ATTEMPTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_tier_attempts_total"), "Pipeline tier attempts by outcome"),
        &["tier", "outcome"]
    ).expect("Failed to create tier_attempts_total metric");

    // Retention Metrics
    pub static ref SWEEPER_DELETIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_sweeper_deletions_total"),
            "Items removed by the retention sweeper"
        ),
        &["kind"]
    ).expect("Failed to create sweeper_deletions_total metric");

    // Error Metrics
    pub static ref ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_errors_total"), "Total errors by type and endpoint"),
        &["error_type", "endpoint"]
    ).expect("Failed to create errors_total metric");

    pub static ref PROCESS_MEMORY_BYTES: Gauge = Gauge::new(
        format!("{PREFIX}_process_memory_bytes"),
        "Process memory usage in bytes"
    ).expect("Failed to create process_memory_bytes metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_SUBMITTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FINISHED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(JOB_PROCESSING_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(TIER_ATTEMPTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SWEEPER_DELETIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(ERRORS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PROCESS_MEMORY_BYTES.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Collapse request paths to their route so job ids don't become label values
pub fn categorize_endpoint(path: &str) -> &'static str {
    match path {
        "/" => "home",
        "/upload" => "upload",
        p if p.starts_with("/api/status/") => "api_status",
        p if p.starts_with("/status/") => "status",
        p if p.starts_with("/download/") => "download",
        _ => "other",
    }
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

pub fn record_job_submitted() {
    JOBS_SUBMITTED_TOTAL.inc();
}

pub fn record_job_started() {
    JOBS_RUNNING.inc();
}

/// Record a job reaching `completed` or `failed`
pub fn record_job_finished(status: &str, processing_time: Duration) {
    JOBS_RUNNING.dec();
    JOBS_FINISHED_TOTAL.with_label_values(&[status]).inc();
    JOB_PROCESSING_DURATION_SECONDS.observe(processing_time.as_secs_f64());
}

pub fn record_tier_attempt(tier: &str, succeeded: bool) {
    let outcome = if succeeded { "success" } else { "failure" };
    TIER_ATTEMPTS_TOTAL.with_label_values(&[tier, outcome]).inc();
}

/// Record items removed by a sweep; `kind` is "job" or "orphan"
pub fn record_sweeper_deletions(kind: &str, count: usize) {
    if count > 0 {
        SWEEPER_DELETIONS_TOTAL
            .with_label_values(&[kind])
            .inc_by(count as f64);
    }
}

/// Record an error
pub fn record_error(error_type: &str, endpoint: &str) {
    ERRORS_TOTAL
        .with_label_values(&[error_type, endpoint])
        .inc();
}

/// Update process memory usage
pub fn update_memory_usage() {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<f64>().ok());
            if let Some(kb) = rss_kb {
                PROCESS_MEMORY_BYTES.set(kb * 1024.0);
            }
        }
    }
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    update_memory_usage();

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
