//! Integration tests for telemetry initialization and span helpers.

use trigger_dispatch::model::{JobId, JobKind, TaskId};
use trigger_dispatch::telemetry::spans::{record_state_transition, start_job_span, start_task_span};
use trigger_dispatch::telemetry::{TelemetryConfig, init_telemetry, metrics};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber may already be set by another test in this
    // process; try_init makes that an Err, not a panic.
    let result = init_telemetry(TelemetryConfig {
        endpoint: None,
        service_name: "dispatch-test".to_string(),
        default_level: "debug".to_string(),
    });
    if let Ok(guard) = result {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn task_span_records_transition() {
    let span = start_task_span(TaskId(1), JobId(2));
    record_state_transition(&span, "ready", "processing");
}

#[test]
fn job_span_creates() {
    let span = start_job_span(JobId(2), JobKind::Socket);
    let _entered = span.enter();
}

#[test]
fn metric_instruments_build_without_a_provider() {
    metrics::stream_operations().add(1, &[]);
    metrics::workers_active().add(1, &[]);
    metrics::workers_active().add(-1, &[]);
    metrics::operation_duration_ms().record(1.5, &[]);
}
