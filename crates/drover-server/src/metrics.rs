//! Prometheus metrics wiring.
//!
//! Counters are emitted through the `metrics` facade at the points where
//! things happen (submission, claim, completion, failure, expiry); the
//! exporter handle renders the text exposition for `GET /metrics`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Build the Prometheus recorder, try to install it globally, and hand back
/// the render handle.
///
/// Installation fails when a recorder is already set (second instance in
/// the same process, e.g. under tests); the handle still renders whatever
/// its own recorder saw, so that is not fatal.
pub fn init_metrics() -> PrometheusHandle {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    if metrics::set_global_recorder(recorder).is_err() {
        tracing::debug!("global metrics recorder already installed");
    }

    metrics::describe_counter!(
        "drover_tasks_submitted_total",
        "Tasks accepted through the HTTP API"
    );
    metrics::describe_counter!(
        "drover_claims_total",
        "Successful task claims across all workers"
    );
    metrics::describe_counter!(
        "drover_tasks_completed_total",
        "Tasks completed by in-process workers"
    );
    metrics::describe_counter!(
        "drover_tasks_failed_total",
        "Tasks failed by in-process workers"
    );
    metrics::describe_counter!(
        "drover_tasks_timed_out_total",
        "Tasks expired by the timeout sweeper"
    );
    metrics::describe_gauge!(
        "drover_queue_depth",
        "Tasks per status, refreshed on scrape"
    );

    handle
}

/// Refresh the queue-depth gauges; called from the scrape handler so the
/// exposition reflects the store at scrape time.
pub fn record_queue_depth(stats: &drover_db::queries::tasks::TaskStats) {
    metrics::gauge!("drover_queue_depth", "status" => "pending").set(stats.pending as f64);
    metrics::gauge!("drover_queue_depth", "status" => "running").set(stats.running as f64);
    metrics::gauge!("drover_queue_depth", "status" => "completed").set(stats.completed as f64);
    metrics::gauge!("drover_queue_depth", "status" => "failed").set(stats.failed as f64);
    metrics::gauge!("drover_queue_depth", "status" => "timeout").set(stats.timeout as f64);
    metrics::gauge!("drover_queue_depth", "status" => "cancelled").set(stats.cancelled as f64);
}
