//! Structured events emitted on every task and job lifecycle transition.
//!
//! Consumers subscribe to the event stream to build dashboards,
//! alerting, or audit logs. The task stream manager fires completion and
//! failure notifications through the same seam.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{JobId, JobKind, TaskId};

/// A structured lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    TaskReady {
        task_id: TaskId,
        job_id: JobId,
        performer_id: Option<i64>,
    },
    TaskProcessing {
        task_id: TaskId,
    },
    TaskCompleted {
        task_id: TaskId,
        job_id: JobId,
    },
    TaskRetryScheduled {
        task_id: TaskId,
        retry_count: u32,
        scheduled_for: DateTime<Utc>,
        reason: String,
    },
    TaskFailed {
        task_id: TaskId,
        job_id: JobId,
        retry_count: u32,
        reason: String,
    },
    JobScheduled {
        job_id: JobId,
        kind: JobKind,
    },
    JobTriggered {
        job_id: JobId,
        task_id: TaskId,
    },
    JobCompleted {
        job_id: JobId,
        reason: String,
    },
}

/// Receives lifecycle events. Must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, kind: EventKind);
}

/// Drops every event.
#[derive(Debug, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _kind: EventKind) {}
}

/// Fans events out over a tokio broadcast channel.
///
/// Slow subscribers lag and miss events rather than applying backpressure.
pub struct BroadcastNotifier {
    seq: AtomicU64,
    tx: broadcast::Sender<Event>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            seq: AtomicU64::new(0),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, kind: EventKind) {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            kind,
        };
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_ordered_sequence_numbers() {
        let notifier = BroadcastNotifier::new(16);
        let mut rx = notifier.subscribe();

        notifier.notify(EventKind::TaskProcessing { task_id: TaskId(1) });
        notifier.notify(EventKind::JobCompleted {
            job_id: JobId(4),
            reason: "expired".into(),
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert!(matches!(second.kind, EventKind::JobCompleted { .. }));
    }

    #[test]
    fn notify_without_subscribers_is_silent() {
        let notifier = BroadcastNotifier::new(4);
        notifier.notify(EventKind::TaskProcessing { task_id: TaskId(1) });
    }
}
