//! Instrumentation (§4.8). Grounded on `metrics.rs`'s `MetricsRecorder`
//! (describe-then-record split, Prometheus handle owned by the host) and the
//! free-function `record_*` style used alongside it.

use metrics_exporter_prometheus::PrometheusHandle;

/// Declares every metric this crate emits, with a description attached.
/// Call once at startup, after installing a recorder (this crate never
/// installs one itself — the host owns that choice, same as `MetricsRecorder`
/// leaving the `PrometheusHandle` up to its caller).
pub fn describe_metrics() {
    metrics::describe_counter!("inbox_messages_written_total", "Messages accepted by Writer::write/write_batch");
    metrics::describe_counter!("inbox_messages_completed_total", "Messages finalized as Complete");
    metrics::describe_counter!("inbox_messages_failed_total", "Messages finalized as Fail (released for retry after an attempt)");
    metrics::describe_counter!("inbox_messages_dead_lettered_total", "Messages finalized as DeadLetter");
    metrics::describe_histogram!("inbox_handler_duration_seconds", "Wall-clock time spent inside one handler invocation");
    metrics::describe_histogram!("inbox_lease_size", "Number of envelopes returned by one ReadAndCapture call");
    metrics::describe_gauge!("inbox_pending_count", "Messages currently pending, per inbox (from HealthMetrics)");
    metrics::describe_gauge!("inbox_captured_count", "Messages currently leased, per inbox (from HealthMetrics)");
}

/// Installs a process-wide Prometheus recorder and describes this crate's
/// metrics against it. Convenience for hosts with no existing `metrics`
/// recorder; most production hosts install their own and call
/// [`describe_metrics`] directly instead.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(handle)
}

/// Publishes one inbox's point-in-time gauges from a [`crate::storage::HealthMetrics`]
/// snapshot. Call this periodically (e.g. from the health-check loop of a host
/// process) rather than on every storage operation.
pub fn record_health_snapshot(inbox_name: &str, snapshot: &crate::storage::HealthMetrics) {
    metrics::gauge!("inbox_pending_count", snapshot.pending_count as f64, "inbox" => inbox_name.to_string());
    metrics::gauge!("inbox_captured_count", snapshot.captured_count as f64, "inbox" => inbox_name.to_string());
}

/// Records the size of one lease returned by `ReadAndCapture`.
pub fn record_lease_size(inbox_name: &str, size: usize) {
    metrics::histogram!("inbox_lease_size", size as f64, "inbox" => inbox_name.to_string());
}
