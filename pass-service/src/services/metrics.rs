//! Metric names and descriptions for pass-service.
//!
//! Recording goes through the `metrics` facade; the Prometheus recorder is
//! installed by `service_core::observability::init_metrics`.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use std::time::Instant;

/// Broker management calls by operation and outcome.
pub const BROKER_REQUESTS_TOTAL: &str = "broker_requests_total";
/// Broker management call latency by operation.
pub const BROKER_REQUEST_DURATION: &str = "broker_request_duration_seconds";
/// Lifecycle transitions by action and outcome.
pub const PASS_TRANSITIONS_TOTAL: &str = "pass_transitions_total";
/// Scheduler ticks.
pub const SCHEDULER_TICKS_TOTAL: &str = "scheduler_ticks_total";
/// Passes skipped because a previous task still held them.
pub const SCHEDULER_SKIPPED_TOTAL: &str = "scheduler_skipped_total";
/// Passes dispatched on the last tick.
pub const SCHEDULER_DISPATCHED: &str = "scheduler_dispatched_passes";
/// Store query latency by operation.
pub const DB_QUERY_DURATION: &str = "db_query_duration_seconds";

/// Register descriptions so the exporter emits HELP lines.
pub fn describe_metrics() {
    describe_counter!(
        BROKER_REQUESTS_TOTAL,
        "Total number of broker management API requests"
    );
    describe_histogram!(
        BROKER_REQUEST_DURATION,
        Unit::Seconds,
        "Broker management API request duration in seconds"
    );
    describe_counter!(
        PASS_TRANSITIONS_TOTAL,
        "Pass lifecycle transitions by action and outcome"
    );
    describe_counter!(SCHEDULER_TICKS_TOTAL, "Scheduler ticks evaluated");
    describe_counter!(
        SCHEDULER_SKIPPED_TOTAL,
        "Passes skipped because they were still being processed"
    );
    describe_gauge!(SCHEDULER_DISPATCHED, "Passes dispatched on the latest tick");
    describe_histogram!(
        DB_QUERY_DURATION,
        Unit::Seconds,
        "Database query duration in seconds"
    );
}

/// Count one lifecycle transition.
pub fn record_transition(action: &'static str, outcome: &'static str) {
    metrics::counter!(PASS_TRANSITIONS_TOTAL, "action" => action, "outcome" => outcome)
        .increment(1);
}

/// Times a store query; call `observe_duration` once it completes.
pub struct QueryTimer {
    operation: &'static str,
    start: Instant,
}

impl QueryTimer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn observe_duration(self) {
        metrics::histogram!(DB_QUERY_DURATION, "operation" => self.operation)
            .record(self.start.elapsed().as_secs_f64());
    }
}
