//! Metrics facade calls for the device-access core.
//!
//! Everything goes through the `metrics` crate; without an installed
//! recorder the calls are no-ops, which is what the tests rely on.

use std::time::Duration;

use ::metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

/// Register metric descriptions. Call once after installing a recorder.
pub fn init_metrics() {
    describe_counter!("cloudctl_worker_tasks_total", "Tasks executed by the worker pool");
    describe_histogram!(
        "cloudctl_worker_task_seconds",
        Unit::Seconds,
        "Time spent executing a worker pool task"
    );
    describe_gauge!("cloudctl_worker_queue_depth", "Tasks waiting for a worker");
    describe_counter!(
        "cloudctl_cache_lookups_total",
        "Result cache lookups by outcome (HIT, MISS, DEDUP)"
    );
    describe_counter!(
        "cloudctl_registry_events_total",
        "Connection registry lifecycle events"
    );
    describe_gauge!("cloudctl_registry_connections", "Pooled device connections");
    describe_counter!("cloudctl_batch_flushes_total", "Batch engine flushes");
    describe_histogram!("cloudctl_batch_size", "Items per flushed batch");
    describe_counter!("cloudctl_stream_frames_total", "Frames pushed to streaming sessions");
    describe_counter!("cloudctl_operations_total", "Device operations by type and outcome");
    describe_histogram!(
        "cloudctl_operation_seconds",
        Unit::Seconds,
        "Device operation latency"
    );
}

pub fn record_worker_task(exec_time: Duration) {
    counter!("cloudctl_worker_tasks_total").increment(1);
    histogram!("cloudctl_worker_task_seconds").record(exec_time.as_secs_f64());
}

pub fn record_worker_queue_depth(depth: usize) {
    gauge!("cloudctl_worker_queue_depth").set(depth as f64);
}

pub fn record_cache_lookup(status: &'static str) {
    counter!("cloudctl_cache_lookups_total", "status" => status).increment(1);
}

/// `event` is one of `created`, `reused`, `evicted`, `expired`, `unhealthy`, `failed`.
pub fn record_registry_event(event: &'static str) {
    counter!("cloudctl_registry_events_total", "event" => event).increment(1);
}

pub fn record_registry_size(size: usize) {
    gauge!("cloudctl_registry_connections").set(size as f64);
}

pub fn record_batch_flush(size: usize, groups: usize) {
    counter!("cloudctl_batch_flushes_total").increment(1);
    histogram!("cloudctl_batch_size").record(size as f64);
    tracing::trace!(size, groups, "batch flushed");
}

pub fn record_stream_frame(ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    counter!("cloudctl_stream_frames_total", "outcome" => outcome).increment(1);
}

pub fn record_operation(op: &'static str, latency: Duration, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    counter!("cloudctl_operations_total", "op" => op, "outcome" => outcome).increment(1);
    histogram!("cloudctl_operation_seconds", "op" => op).record(latency.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        init_metrics();
        record_worker_task(Duration::from_millis(3));
        record_worker_queue_depth(4);
        record_cache_lookup("HIT");
        record_registry_event("created");
        record_registry_size(1);
        record_batch_flush(10, 2);
        record_stream_frame(false);
        record_operation("tap", Duration::from_millis(12), true);
    }
}
