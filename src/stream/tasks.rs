//! Task lifecycle over the `tasks:*` streams.
//!
//! ```text
//! ready -> processing -> completed
//!   \          \
//!    `----------`-> retry (retry_count < max) -> ready-eligible once due
//!                `-> failed (retry_count >= max, terminal)
//! ```
//!
//! Transport failures surface as `AppendFailed` / `ReadFailed`; this
//! manager never retries them itself and never touches `retry_count` for
//! them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use super::{
    StreamLog, TASKS_COMPLETED, TASKS_FAILED, TASKS_PROCESSING, TASKS_READY, TASKS_RETRY,
};
use crate::config::StreamConfig;
use crate::error::Result;
use crate::event::{EventKind, Notifier};
use crate::model::TaskRecord;
use crate::store::EntryId;
use crate::telemetry::metrics;
use crate::telemetry::spans::{record_state_transition, start_task_span};

/// Result of a [`TaskStreamManager::retry`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Scheduled {
        retry_count: u32,
        scheduled_for: DateTime<Utc>,
    },
    /// The task hit the retry ceiling and moved to `tasks:failed`.
    Failed { retry_count: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStat {
    pub name: &'static str,
    pub length: u64,
    /// `None` for streams that never expire.
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub streams: Vec<StreamStat>,
    pub max_len: usize,
    pub max_retry_attempts: u32,
    pub retry_backoff_base_secs: u64,
}

pub struct TaskStreamManager {
    log: Arc<StreamLog>,
    config: StreamConfig,
    notifier: Arc<dyn Notifier>,
}

impl TaskStreamManager {
    pub fn new(log: Arc<StreamLog>, config: StreamConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            log,
            config,
            notifier,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    fn stream_ttls(&self) -> [(&'static str, Option<Duration>); 5] {
        [
            (TASKS_READY, None),
            (TASKS_PROCESSING, Some(self.config.processing_ttl)),
            (TASKS_COMPLETED, Some(self.config.completed_ttl)),
            (TASKS_FAILED, Some(self.config.failed_ttl)),
            (TASKS_RETRY, Some(self.config.retry_ttl)),
        ]
    }

    /// Create every task stream with its retention.
    pub async fn initialize(&self) -> Result<()> {
        for (stream, ttl) in self.stream_ttls() {
            self.log.create_if_absent(stream, ttl).await?;
        }
        info!("task streams initialized");
        Ok(())
    }

    /// Admit a signed task with a performer assignment.
    pub async fn submit_ready(&self, task: &TaskRecord) -> Result<EntryId> {
        task.check_admissible()?;
        let id = self
            .log
            .append(TASKS_READY, task, self.config.max_len)
            .await?;
        self.transition(task, "new", "ready");
        self.notifier.notify(EventKind::TaskReady {
            task_id: task.task_id,
            job_id: task.job_id,
            performer_id: task.performer_id,
        });
        Ok(id)
    }

    pub async fn mark_processing(&self, task: &mut TaskRecord) -> Result<EntryId> {
        task.processing_started_at = Some(Utc::now());
        let id = self
            .log
            .append(TASKS_PROCESSING, task, self.config.max_len)
            .await?;
        self.transition(task, "ready", "processing");
        self.notifier.notify(EventKind::TaskProcessing {
            task_id: task.task_id,
        });
        Ok(id)
    }

    pub async fn mark_completed(&self, task: &mut TaskRecord) -> Result<EntryId> {
        task.completed_at = Some(Utc::now());
        let id = self
            .log
            .append(TASKS_COMPLETED, task, self.config.max_len)
            .await?;
        self.transition(task, "processing", "completed");
        self.notifier.notify(EventKind::TaskCompleted {
            task_id: task.task_id,
            job_id: task.job_id,
        });
        Ok(id)
    }

    /// Record a failed delivery attempt.
    ///
    /// Bumps `retry_count` and schedules the next attempt; at the retry
    /// ceiling the task goes to `tasks:failed` only. `task` is updated only
    /// once the append succeeds, so an `AppendFailed` leaves it untouched.
    pub async fn retry(&self, task: &mut TaskRecord, reason: &str) -> Result<RetryOutcome> {
        let now = Utc::now();
        let mut next = task.clone();
        next.retry_count += 1;
        next.last_attempt_at = Some(now);
        next.last_error = Some(reason.to_string());
        let backoff = self.compute_backoff(next.retry_count);
        let scheduled_for = now
            + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
        next.scheduled_for = Some(scheduled_for);

        if next.retry_count >= self.config.max_retry_attempts {
            self.log
                .append(TASKS_FAILED, &next, self.config.max_len)
                .await?;
            *task = next;
            metrics::task_retries().add(1, &[]);
            self.transition(task, "processing", "failed");
            warn!(
                task_id = %task.task_id,
                job_id = %task.job_id,
                retry_count = task.retry_count,
                reason,
                "task exhausted retries"
            );
            self.notifier.notify(EventKind::TaskFailed {
                task_id: task.task_id,
                job_id: task.job_id,
                retry_count: task.retry_count,
                reason: reason.to_string(),
            });
            return Ok(RetryOutcome::Failed {
                retry_count: task.retry_count,
            });
        }

        self.log
            .append(TASKS_RETRY, &next, self.config.max_len)
            .await?;
        *task = next;
        metrics::task_retries().add(1, &[]);
        self.transition(task, "processing", "retry");
        info!(
            task_id = %task.task_id,
            retry_count = task.retry_count,
            backoff_ms = backoff.as_millis() as u64,
            reason,
            "task scheduled for retry"
        );
        self.notifier.notify(EventKind::TaskRetryScheduled {
            task_id: task.task_id,
            retry_count: task.retry_count,
            scheduled_for,
            reason: reason.to_string(),
        });
        Ok(RetryOutcome::Scheduled {
            retry_count: task.retry_count,
            scheduled_for,
        })
    }

    /// `retry_count * base + uniform(0, base)`.
    pub fn compute_backoff(&self, retry_count: u32) -> Duration {
        let base = self.config.retry_backoff_base;
        let jitter_ms = match base.as_millis() as u64 {
            0 => 0,
            ms => rand::thread_rng().gen_range(0..ms),
        };
        base * retry_count + Duration::from_millis(jitter_ms)
    }

    pub async fn next_ready(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<(EntryId, TaskRecord)>> {
        self.log
            .read_batch(TASKS_READY, group, consumer, count, self.config.read_block)
            .await
    }

    /// Retry entries that are due now.
    ///
    /// Entries read before their `scheduled_for` are put back at the tail of
    /// `tasks:retry` and acknowledged, so they are neither redelivered early
    /// nor lost.
    pub async fn next_retry(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<(EntryId, TaskRecord)>> {
        let batch: Vec<(EntryId, TaskRecord)> = self
            .log
            .read_batch(TASKS_RETRY, group, consumer, count, self.config.read_block)
            .await?;

        let now = Utc::now();
        let mut due = Vec::with_capacity(batch.len());
        for (id, task) in batch {
            if task.is_due(now) {
                due.push((id, task));
            } else {
                self.log
                    .append(TASKS_RETRY, &task, self.config.max_len)
                    .await?;
                self.log.ack(TASKS_RETRY, group, &id).await?;
            }
        }
        Ok(due)
    }

    pub async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        self.log.ack(stream, group, id).await
    }

    /// Take over entries another consumer of `group` received but never
    /// acknowledged within `min_idle`.
    pub async fn reclaim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<(EntryId, TaskRecord)>> {
        let claimed: Vec<(EntryId, TaskRecord)> = self
            .log
            .claim_stale(stream, group, consumer, min_idle, count)
            .await?;
        if !claimed.is_empty() {
            info!(stream, group, consumer, count = claimed.len(), "reclaimed stale entries");
        }
        Ok(claimed)
    }

    pub async fn stream_info(&self) -> Result<StreamInfo> {
        let mut streams = Vec::new();
        for (name, ttl) in self.stream_ttls() {
            streams.push(StreamStat {
                name,
                length: self.log.len(name).await?,
                ttl_secs: ttl.map(|t| t.as_secs()),
            });
        }
        Ok(StreamInfo {
            streams,
            max_len: self.config.max_len,
            max_retry_attempts: self.config.max_retry_attempts,
            retry_backoff_base_secs: self.config.retry_backoff_base.as_secs(),
        })
    }

    fn transition(&self, task: &TaskRecord, from: &'static str, to: &'static str) {
        let span = start_task_span(task.task_id, task.job_id);
        record_state_transition(&span, from, to);
        metrics::task_transitions().add(
            1,
            &[KeyValue::new("from", from), KeyValue::new("to", to)],
        );
    }
}
