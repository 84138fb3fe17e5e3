//! Prometheus metrics for blobshard.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants for the listing engine, the namespace
//! directory and replication, and exposes the `/metrics` endpoint handler.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

// -- Metric name constants ----------------------------------------------------

/// Merged listings served (counter). Labels: outcome.
pub const LISTINGS_TOTAL: &str = "blobshard_listings_total";

/// Merged listing duration in seconds (histogram).
pub const LISTING_DURATION_SECONDS: &str = "blobshard_listing_duration_seconds";

/// Shard listings treated as empty (counter). Labels: account, reason.
pub const SHARD_LISTINGS_SOFT_FAILED_TOTAL: &str = "blobshard_shard_listings_soft_failed_total";

/// Lost compare-and-swap rounds on namespace records (counter). Labels: operation.
pub const CAS_CONFLICTS_TOTAL: &str = "blobshard_cas_conflicts_total";

/// Replication jobs handed to the queue (counter). Labels: kind.
pub const REPLICATION_JOBS_ENQUEUED_TOTAL: &str = "blobshard_replication_jobs_enqueued_total";

/// Replication enqueue attempts that failed (counter).
pub const REPLICATION_ENQUEUE_FAILURES_TOTAL: &str =
    "blobshard_replication_enqueue_failures_total";

/// Replication jobs completed by a worker (counter). Labels: kind, outcome.
pub const REPLICATION_JOBS_PROCESSED_TOTAL: &str = "blobshard_replication_jobs_processed_total";

/// Replication jobs that failed and were left for redelivery (counter). Labels: kind.
pub const REPLICATION_JOBS_FAILED_TOTAL: &str = "blobshard_replication_jobs_failed_total";

/// Jobs dropped after too many deliveries (counter).
pub const REPLICATION_POISON_JOBS_TOTAL: &str = "blobshard_replication_poison_jobs_total";

/// Approximate number of queued replication jobs (gauge).
pub const REPLICATION_QUEUE_DEPTH: &str = "blobshard_replication_queue_depth";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(LISTINGS_TOTAL, "Merged listings served by outcome");
    describe_histogram!(
        LISTING_DURATION_SECONDS,
        "Merged listing duration in seconds"
    );
    describe_counter!(
        SHARD_LISTINGS_SOFT_FAILED_TOTAL,
        "Shard listings treated as empty"
    );
    describe_counter!(CAS_CONFLICTS_TOTAL, "Lost compare-and-swap rounds");
    describe_counter!(
        REPLICATION_JOBS_ENQUEUED_TOTAL,
        "Replication jobs handed to the queue"
    );
    describe_counter!(
        REPLICATION_ENQUEUE_FAILURES_TOTAL,
        "Replication enqueue attempts that failed"
    );
    describe_counter!(
        REPLICATION_JOBS_PROCESSED_TOTAL,
        "Replication jobs completed by outcome"
    );
    describe_counter!(
        REPLICATION_JOBS_FAILED_TOTAL,
        "Replication jobs left for redelivery"
    );
    describe_counter!(
        REPLICATION_POISON_JOBS_TOTAL,
        "Replication jobs dropped after too many deliveries"
    );
    describe_gauge!(REPLICATION_QUEUE_DEPTH, "Approximate replication queue depth");
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; version=0.0.4")],
            String::from("metrics disabled\n"),
        ),
    }
}

// -- Tests --------------------------------------------------------------------
