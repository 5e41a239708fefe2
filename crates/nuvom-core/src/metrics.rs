//! Metrics instrumentation and the pull-based snapshot (§4.8)
//!
//! The runtime only emits metrics through the `metrics` facade; which
//! exporter (if any) is installed is entirely the host's concern, mirroring
//! `frontend/src/wrkmgr/metrics.rs`. [`metrics_snapshot`] additionally
//! exposes a plain, exporter-independent pull snapshot for hosts that want
//! the numbers without scraping Prometheus.
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use serde::Serialize;

pub const JOBS_SUBMITTED_TOTAL: &str = "nuvom_jobs_submitted_total";
pub const JOBS_SUCCEEDED_TOTAL: &str = "nuvom_jobs_succeeded_total";
pub const JOBS_FAILED_TOTAL: &str = "nuvom_jobs_failed_total";
pub const JOBS_TIMED_OUT_TOTAL: &str = "nuvom_jobs_timed_out_total";
pub const JOBS_RETRIED_TOTAL: &str = "nuvom_jobs_retried_total";
pub const QUEUE_SIZE: &str = "nuvom_queue_size";
pub const INFLIGHT_JOBS: &str = "nuvom_inflight_jobs";
pub const WORKER_COUNT: &str = "nuvom_worker_count";
pub const JOB_DURATION_SECONDS: &str = "nuvom_job_duration_seconds";

/// Registers every metric's description and unit. Call once at startup,
/// before the first increment/set/record, exactly as
/// `wrkmgr/metrics.rs::init` does for the director's AMQP counters.
pub fn install_descriptions() {
    describe_counter!(JOBS_SUBMITTED_TOTAL, "Total jobs submitted to a queue backend");
    describe_counter!(JOBS_SUCCEEDED_TOTAL, "Total jobs that finished with status SUCCESS");
    describe_counter!(JOBS_FAILED_TOTAL, "Total jobs that finished with status FAILED");
    describe_counter!(JOBS_TIMED_OUT_TOTAL, "Total jobs that finished with status TIMEOUT");
    describe_counter!(JOBS_RETRIED_TOTAL, "Total retry requeues issued by the job runner");
    describe_gauge!(QUEUE_SIZE, "Approximate count of pending jobs in the queue backend");
    describe_gauge!(INFLIGHT_JOBS, "Jobs currently leased out to a worker");
    describe_gauge!(WORKER_COUNT, "Configured size of the worker pool");
    describe_histogram!(JOB_DURATION_SECONDS, "Wall-clock duration of a single job attempt");
}

pub fn record_submitted() {
    counter!(JOBS_SUBMITTED_TOTAL).increment(1);
}

pub fn record_succeeded(duration: std::time::Duration) {
    counter!(JOBS_SUCCEEDED_TOTAL).increment(1);
    histogram!(JOB_DURATION_SECONDS).record(duration.as_secs_f64());
}

pub fn record_failed(duration: std::time::Duration) {
    counter!(JOBS_FAILED_TOTAL).increment(1);
    histogram!(JOB_DURATION_SECONDS).record(duration.as_secs_f64());
}

pub fn record_timed_out(duration: std::time::Duration) {
    counter!(JOBS_TIMED_OUT_TOTAL).increment(1);
    histogram!(JOB_DURATION_SECONDS).record(duration.as_secs_f64());
}

pub fn record_retried() {
    counter!(JOBS_RETRIED_TOTAL).increment(1);
}

pub fn set_queue_size(size: usize) {
    gauge!(QUEUE_SIZE).set(size as f64);
}

pub fn set_inflight_jobs(count: usize) {
    gauge!(INFLIGHT_JOBS).set(count as f64);
}

pub fn set_worker_count(count: usize) {
    gauge!(WORKER_COUNT).set(count as f64);
}

/// The pull-based snapshot returned by [`crate::pool::WorkerPool::metrics_snapshot`].
/// Independent of whichever exporter (if any) the host installed.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub queue_size: usize,
    pub inflight_jobs: usize,
    pub worker_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_descriptions_does_not_panic_without_a_recorder() {
        install_descriptions();
    }

    #[test]
    fn snapshot_is_a_plain_value() {
        let snapshot = MetricsSnapshot {
            queue_size: 3,
            inflight_jobs: 1,
            worker_count: 4,
        };
        assert_eq!(snapshot.queue_size, 3);
    }
}
