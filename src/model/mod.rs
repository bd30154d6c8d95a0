//! Core data model.
//!
//! A job is a long-lived trigger definition; a task is one dispatchable
//! execution produced when a job's trigger fires.

pub mod job;
pub mod task;

use serde::{Deserialize, Serialize};

pub use job::{
    ConditionSpec, ConditionType, EventSpec, JobKind, JobRecord, JobTrigger, SocketSpec,
    SourceType,
};
pub use task::{
    DispatchPayload, SignedDispatch, TaskRecord, TaskTarget, TaskTrigger, TriggerDetail,
};

/// Newtype for job IDs, assigned by the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
