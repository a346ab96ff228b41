use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<Option<IntCounterVec>> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<Option<HistogramVec>> = OnceLock::new();
static SESSIONS_OPENED_TOTAL: OnceLock<Option<IntCounter>> = OnceLock::new();
static REPORT_RUNS_TOTAL: OnceLock<Option<IntCounterVec>> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: Result<T, prometheus::Error>, name: &str) -> Option<T>
where
    T: prometheus::core::Collector + Clone + 'static,
{
    match collector {
        Ok(collector) => {
            let _ = registry().register(Box::new(collector.clone()));
            Some(collector)
        }
        Err(err) => {
            tracing::warn!(metric = name, error = %err, "failed to create metric");
            None
        }
    }
}

fn http_requests_total() -> Option<&'static IntCounterVec> {
    HTTP_REQUESTS_TOTAL
        .get_or_init(|| {
            register_collector(
                IntCounterVec::new(
                    Opts::new(
                        "reporting_http_requests_total",
                        "Reporting gateway HTTP request count.",
                    ),
                    &["route", "method", "status"],
                ),
                "reporting_http_requests_total",
            )
        })
        .as_ref()
}

fn http_request_duration_seconds() -> Option<&'static HistogramVec> {
    HTTP_REQUEST_DURATION_SECONDS
        .get_or_init(|| {
            register_collector(
                HistogramVec::new(
                    HistogramOpts::new(
                        "reporting_http_request_duration_seconds",
                        "Reporting gateway HTTP request duration in seconds.",
                    )
                    .buckets(vec![
                        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
                    ]),
                    &["route", "method", "outcome"],
                ),
                "reporting_http_request_duration_seconds",
            )
        })
        .as_ref()
}

fn sessions_opened_total() -> Option<&'static IntCounter> {
    SESSIONS_OPENED_TOTAL
        .get_or_init(|| {
            register_collector(
                IntCounter::new(
                    "reporting_sessions_opened_total",
                    "Reporting database sessions opened.",
                ),
                "reporting_sessions_opened_total",
            )
        })
        .as_ref()
}

fn report_runs_total() -> Option<&'static IntCounterVec> {
    REPORT_RUNS_TOTAL
        .get_or_init(|| {
            register_collector(
                IntCounterVec::new(
                    Opts::new("reporting_report_runs_total", "Report executions by outcome."),
                    &["outcome"],
                ),
                "reporting_report_runs_total",
            )
        })
        .as_ref()
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    if let Some(counter) = http_requests_total() {
        counter
            .with_label_values(&[route, method, status_str.as_str()])
            .inc();
    }

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    if let Some(histogram) = http_request_duration_seconds() {
        histogram
            .with_label_values(&[route, method, outcome])
            .observe(duration.as_secs_f64());
    }
}

pub fn inc_sessions_opened() {
    if let Some(counter) = sessions_opened_total() {
        counter.inc();
    }
}

pub fn observe_report_run(outcome: &str) {
    if let Some(counter) = report_runs_total() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = sessions_opened_total();
    let _ = report_runs_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
