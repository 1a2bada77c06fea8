use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

#[derive(Debug, Default)]
pub struct Metrics {
    request_total: AtomicU64,
    request_success: AtomicU64,
    request_error: AtomicU64,
    checks_total: AtomicU64,
    checks_allowed: AtomicU64,
    lookups_total: AtomicU64,
    writes_total: AtomicU64,
    schema_writes_total: AtomicU64,
    timeouts_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.request_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.request_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.request_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_check(&self, allowed: bool) {
        self.checks_total.fetch_add(1, Ordering::Relaxed);
        if allowed {
            self.checks_allowed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_lookup(&self) {
        self.lookups_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_schema_write(&self) {
        self.schema_writes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_total(&self) -> u64 {
        self.request_total.load(Ordering::Relaxed)
    }

    pub fn request_success(&self) -> u64 {
        self.request_success.load(Ordering::Relaxed)
    }

    pub fn request_error(&self) -> u64 {
        self.request_error.load(Ordering::Relaxed)
    }

    pub fn checks_total(&self) -> u64 {
        self.checks_total.load(Ordering::Relaxed)
    }

    pub fn checks_allowed(&self) -> u64 {
        self.checks_allowed.load(Ordering::Relaxed)
    }

    pub fn lookups_total(&self) -> u64 {
        self.lookups_total.load(Ordering::Relaxed)
    }

    pub fn writes_total(&self) -> u64 {
        self.writes_total.load(Ordering::Relaxed)
    }

    pub fn schema_writes_total(&self) -> u64 {
        self.schema_writes_total.load(Ordering::Relaxed)
    }

    pub fn timeouts_total(&self) -> u64 {
        self.timeouts_total.load(Ordering::Relaxed)
    }

    pub fn render_prometheus(&self) -> String {
        let counters = [
            ("tessera_requests_total", "Total number of requests.", self.request_total()),
            ("tessera_requests_success_total", "Total successful requests.", self.request_success()),
            ("tessera_requests_error_total", "Total failed requests.", self.request_error()),
            ("tessera_checks_total", "Permission checks evaluated.", self.checks_total()),
            ("tessera_checks_allowed_total", "Permission checks that were allowed.", self.checks_allowed()),
            ("tessera_lookups_total", "Entity and subject lookups evaluated.", self.lookups_total()),
            ("tessera_writes_total", "Relationship and attribute write batches.", self.writes_total()),
            ("tessera_schema_writes_total", "Schema versions written.", self.schema_writes_total()),
            ("tessera_timeouts_total", "Evaluations that hit the request timeout.", self.timeouts_total()),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(output, "{name} {value}");
        }
        output
    }
}

pub async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        metrics.render_prometheus(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_metrics_are_zero() {
        let m = Metrics::new();
        assert_eq!(m.request_total(), 0);
        assert_eq!(m.request_success(), 0);
        assert_eq!(m.request_error(), 0);
        assert_eq!(m.checks_total(), 0);
        assert_eq!(m.timeouts_total(), 0);
    }

    #[test]
    fn record_increments_counters() {
        let m = Metrics::new();
        m.record_request();
        m.record_request();
        m.record_success();
        m.record_error();

        assert_eq!(m.request_total(), 2);
        assert_eq!(m.request_success(), 1);
        assert_eq!(m.request_error(), 1);
    }

    #[test]
    fn record_check_counts_allowed_separately() {
        let m = Metrics::new();
        m.record_check(true);
        m.record_check(false);
        m.record_check(true);

        assert_eq!(m.checks_total(), 3);
        assert_eq!(m.checks_allowed(), 2);
    }

    #[test]
    fn render_prometheus_format() {
        let m = Metrics::new();
        m.record_request();
        m.record_success();
        m.record_lookup();

        let output = m.render_prometheus();

        assert!(output.contains("# TYPE tessera_requests_total counter"));
        assert!(output.contains("tessera_requests_total 1"));
        assert!(output.contains("tessera_requests_success_total 1"));
        assert!(output.contains("tessera_requests_error_total 0"));
        assert!(output.contains("tessera_lookups_total 1"));
    }

    #[test]
    fn prometheus_output_includes_write_and_timeout_counters() {
        let m = Metrics::new();
        m.record_write();
        m.record_schema_write();
        m.record_timeout();

        let output = m.render_prometheus();
        assert!(
            output.contains("tessera_writes_total 1"),
            "missing writes: {output}"
        );
        assert!(
            output.contains("tessera_schema_writes_total 1"),
            "missing schema writes: {output}"
        );
        assert!(
            output.contains("tessera_timeouts_total 1"),
            "missing timeouts: {output}"
        );
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_text() {
        let metrics = Arc::new(Metrics::new());
        metrics.record_request();
        metrics.record_request();
        metrics.record_success();

        let app = axum::Router::new()
            .route("/metrics", axum::routing::get(metrics_handler))
            .with_state(metrics);

        let server = axum_test::TestServer::new(app).unwrap();
        let response = server.get("/metrics").await;

        response.assert_status_ok();
        let body = response.text();
        assert!(body.contains("tessera_requests_total 2"));
        assert!(body.contains("tessera_requests_success_total 1"));
    }
}
