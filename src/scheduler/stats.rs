//! Snapshot types returned by the scheduler's stats queries.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{JobId, JobKind};
use crate::stream::StreamInfo;
use crate::worker::WorkerState;

#[derive(Debug, Clone, Serialize)]
pub struct JobStats {
    pub job_id: JobId,
    pub kind: JobKind,
    pub recurring: bool,
    pub expiration_time: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub state: WorkerState,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerCounts {
    pub condition: usize,
    pub event: usize,
    pub socket: usize,
}

impl WorkerCounts {
    pub fn total(&self) -> usize {
        self.condition + self.event + self.socket
    }

    pub(crate) fn add(&mut self, kind: JobKind) {
        match kind {
            JobKind::Condition => self.condition += 1,
            JobKind::Event => self.event += 1,
            JobKind::Socket => self.socket += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub scheduler_id: i64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub max_workers: usize,
    pub workers: WorkerCounts,
    pub jobs_scheduled: u64,
    pub tasks_dispatched: u64,
    pub duplicate_triggers: u64,
    pub dispatch_failures: u64,
    pub jobs_running: u64,
    pub jobs_completed: u64,
    pub streams: StreamInfo,
}
