//! Metric instrument factories.
//!
//! Instruments come from the `"trigger-dispatch"` meter on the global
//! `MeterProvider`; without one installed they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

fn meter() -> Meter {
    opentelemetry::global::meter("trigger-dispatch")
}

/// Counter: stream store operations.
/// Labels: `stream`, `operation`.
pub fn stream_operations() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.stream.operations")
        .with_description("Number of stream operations")
        .build()
}

/// Counter: task state transitions.
/// Labels: `from`, `to`.
pub fn task_transitions() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.task.transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: task-level retries (not transport retries).
pub fn task_retries() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.task.retries")
        .with_description("Number of failed task delivery attempts")
        .build()
}

/// Counter: jobs admitted to the scheduler.
/// Labels: `kind`.
pub fn jobs_scheduled() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.jobs.scheduled")
        .with_description("Number of jobs scheduled")
        .build()
}

/// Counter: jobs removed from the scheduler.
/// Labels: `reason` ("expired" | "triggered" | "unscheduled" | "failed" | "lock_held").
pub fn jobs_unscheduled() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.jobs.unscheduled")
        .with_description("Number of jobs unscheduled")
        .build()
}

/// Up/down counter: running workers.
pub fn workers_active() -> UpDownCounter<i64> {
    meter()
        .i64_up_down_counter("dispatch.workers.active")
        .with_description("Number of running workers")
        .build()
}

/// Counter: trigger evaluations.
/// Labels: `source`, `satisfied`.
pub fn conditions_checked() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.conditions.checked")
        .with_description("Number of trigger evaluations")
        .build()
}

/// Counter: trigger handoffs.
/// Labels: `result` ("ok" | "duplicate" | "stale" | "error").
pub fn triggers_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.triggers.dispatched")
        .with_description("Number of trigger notifications handled")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("dispatch.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
