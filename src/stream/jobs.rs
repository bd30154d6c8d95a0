//! Job lifecycle over `jobs:running` and `jobs:completed`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{JOBS_COMPLETED, JOBS_RUNNING, StreamLog};
use crate::config::StreamConfig;
use crate::error::Result;
use crate::event::{EventKind, Notifier};
use crate::model::{JobId, JobKind, JobRecord};
use crate::store::EntryId;

/// Consumer group that owns `jobs:running` bookkeeping.
pub const JOBS_GROUP: &str = "scheduler";

/// What the job streams record about a monitoring job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLifecycleRecord {
    pub job_id: JobId,
    pub kind: JobKind,
    pub task_definition_id: i32,
    pub recurring: bool,
    pub expiration_time: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl JobLifecycleRecord {
    pub fn running(job: &JobRecord) -> Self {
        Self {
            job_id: job.job_id,
            kind: job.kind(),
            task_definition_id: job.task_definition_id,
            recurring: job.recurring,
            expiration_time: job.expiration_time,
            started_at: Utc::now(),
            completed_at: None,
            reason: None,
        }
    }
}

pub struct JobStreamManager {
    log: Arc<StreamLog>,
    config: StreamConfig,
    notifier: Arc<dyn Notifier>,
}

impl JobStreamManager {
    pub fn new(log: Arc<StreamLog>, config: StreamConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            log,
            config,
            notifier,
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.log.create_if_absent(JOBS_RUNNING, None).await?;
        self.log
            .create_if_absent(JOBS_COMPLETED, Some(self.config.jobs_completed_ttl))
            .await?;
        self.log.register_group(JOBS_RUNNING, JOBS_GROUP).await
    }

    pub async fn add_running(&self, record: &JobLifecycleRecord) -> Result<EntryId> {
        let id = self
            .log
            .append(JOBS_RUNNING, record, self.config.max_len)
            .await?;
        debug!(job_id = %record.job_id, entry_id = %id, "job running");
        Ok(id)
    }

    /// Append to `jobs:completed`, then acknowledge the running entry.
    ///
    /// A failed acknowledgment is logged only; the job is terminal either way.
    pub async fn move_to_completed(
        &self,
        mut record: JobLifecycleRecord,
        running_entry: &str,
        reason: &str,
    ) -> Result<EntryId> {
        record.completed_at = Some(Utc::now());
        record.reason = Some(reason.to_string());
        let id = self
            .log
            .append(JOBS_COMPLETED, &record, self.config.max_len)
            .await?;

        if let Err(e) = self.log.ack(JOBS_RUNNING, JOBS_GROUP, running_entry).await {
            warn!(job_id = %record.job_id, error = %e, "failed to ack running job entry");
        }

        self.notifier.notify(EventKind::JobCompleted {
            job_id: record.job_id,
            reason: reason.to_string(),
        });
        Ok(id)
    }

    pub async fn running_len(&self) -> Result<u64> {
        self.log.len(JOBS_RUNNING).await
    }

    pub async fn completed_len(&self) -> Result<u64> {
        self.log.len(JOBS_COMPLETED).await
    }
}
