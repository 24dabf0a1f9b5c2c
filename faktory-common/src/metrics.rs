//! Prometheus metrics endpoint and the counters/histograms the fetch loop
//! records into it.

use std::time::Instant;

use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::{body::Body, routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Bind a `TcpListener` on `bind` and serve `router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// A `/metrics` route backed by a fresh Prometheus recorder, wrapped in an
/// HTTP-latency tracking middleware.
pub fn setup_metrics_router() -> Router {
    let recorder_handle = setup_metrics_recorder();

    Router::new()
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();
    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

/// Job-runtime counters recorded around each fetch/execute cycle.
pub fn record_job_fetched(jobtype: &str, queue: &str) {
    let labels = [
        ("jobtype", jobtype.to_owned()),
        ("queue", queue.to_owned()),
    ];
    metrics::counter!("faktory_jobs_fetched_total", &labels).increment(1);
}

pub fn record_job_completed(jobtype: &str, queue: &str, duration_secs: f64) {
    let labels = [
        ("jobtype", jobtype.to_owned()),
        ("queue", queue.to_owned()),
    ];
    metrics::counter!("faktory_jobs_completed_total", &labels).increment(1);
    metrics::histogram!("faktory_jobs_processing_duration_seconds", &labels).record(duration_secs);
}

pub fn record_job_failed(jobtype: &str, queue: &str) {
    let labels = [
        ("jobtype", jobtype.to_owned()),
        ("queue", queue.to_owned()),
    ];
    metrics::counter!("faktory_jobs_failed_total", &labels).increment(1);
}

pub fn record_saturation_percent(in_flight: usize, capacity: usize) {
    let percent = if capacity == 0 {
        0.0
    } else {
        (in_flight as f64 / capacity as f64) * 100.0
    };
    metrics::gauge!("faktory_worker_saturation_percent").set(percent);
}

/// Connections currently borrowed from a [`crate::pool::Pool`] (as opposed to
/// idle or not yet created), recorded on every acquire/release.
pub fn record_pool_connections_in_use(in_use: usize) {
    metrics::gauge!("faktory_pool_connections_in_use").set(in_use as f64);
}
