//! Span helpers for tasks and jobs.

use tracing::Span;

use crate::model::{JobId, JobKind, TaskId};

/// Span for one task's lifecycle step.
pub fn start_task_span(task_id: TaskId, job_id: JobId) -> Span {
    tracing::info_span!(
        "task.lifecycle",
        "task.id" = %task_id,
        "job.id" = %job_id,
        "task.state" = tracing::field::Empty,
    )
}

/// Span covering a worker's whole life.
pub fn start_job_span(job_id: JobId, kind: JobKind) -> Span {
    tracing::info_span!(
        "job.monitor",
        "job.id" = %job_id,
        "job.kind" = kind.as_str(),
    )
}

/// Record a state transition on `span` and set its state field.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
