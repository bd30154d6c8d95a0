//! Task records: one dispatchable execution of a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, TaskId};
use crate::error::{Error, Result};

/// The contract call a performer executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTarget {
    pub target_chain_id: String,
    pub target_contract_address: String,
    pub target_function: String,
    #[serde(default)]
    pub abi: Option<String>,
    #[serde(default)]
    pub arg_type: Option<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Script that computes arguments at execution time.
    #[serde(default)]
    pub dynamic_arguments_script_url: Option<String>,
}

#[cfg(test)]
impl TaskTarget {
    pub(crate) fn for_tests() -> Self {
        Self {
            target_chain_id: "84532".into(),
            target_contract_address: "0x98a170b9b24aD4f42B6B3630A54517fd7Ff3Ac6d".into(),
            target_function: "execute".into(),
            abi: None,
            arg_type: None,
            arguments: vec![],
            dynamic_arguments_script_url: None,
        }
    }
}

/// What fired, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTrigger {
    pub triggered_at: DateTime<Utc>,
    pub detail: TriggerDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerDetail {
    Condition {
        satisfied_value: f64,
        condition_type: String,
        value_source: String,
        lower_limit: f64,
        upper_limit: f64,
    },
    Event {
        tx_hash: String,
        chain_id: String,
        contract_address: String,
        event_name: String,
    },
    Socket {
        satisfied_value: f64,
        condition_type: String,
        socket_url: String,
    },
}

/// The payload the scheduler signs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub task_definition_id: i32,
    pub scheduler_id: i64,
    pub target: TaskTarget,
    pub trigger: TaskTrigger,
}

impl DispatchPayload {
    /// Canonical bytes covered by the scheduler signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedDispatch {
    pub payload: DispatchPayload,
    pub scheduler_signature: String,
}

// ---------------------------------------------------------------------------
// Task Record
// ---------------------------------------------------------------------------

/// A unit of dispatchable work as it moves between task streams.
///
/// Records are never mutated in a stream; each transition appends a new
/// copy to the destination stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub task_definition_id: i32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest instant a retry may be redelivered.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub performer_id: Option<i64>,
    pub dispatch: SignedDispatch,
}

impl TaskRecord {
    pub fn new(dispatch: SignedDispatch, performer_id: Option<i64>) -> Self {
        Self {
            task_id: dispatch.payload.task_id,
            job_id: dispatch.payload.job_id,
            task_definition_id: dispatch.payload.task_definition_id,
            retry_count: 0,
            last_attempt_at: None,
            scheduled_for: None,
            processing_started_at: None,
            completed_at: None,
            last_error: None,
            performer_id,
            dispatch,
        }
    }

    /// Whether a retry entry may be redelivered at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.is_none_or(|at| at <= now)
    }

    /// A task enters `ready` only with a performer and a signature.
    pub fn check_admissible(&self) -> Result<()> {
        if self.performer_id.is_none() {
            return Err(Error::InvalidTask(format!(
                "task {} has no performer assignment",
                self.task_id
            )));
        }
        if self.dispatch.scheduler_signature.is_empty() {
            return Err(Error::InvalidTask(format!(
                "task {} is not signed",
                self.task_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_task(task_id: i64) -> TaskRecord {
    let payload = DispatchPayload {
        task_id: TaskId(task_id),
        job_id: JobId(1),
        task_definition_id: 5,
        scheduler_id: 1,
        target: TaskTarget::for_tests(),
        trigger: TaskTrigger {
            triggered_at: Utc::now(),
            detail: TriggerDetail::Condition {
                satisfied_value: 150.0,
                condition_type: "greater_than".into(),
                value_source: "static".into(),
                lower_limit: 100.0,
                upper_limit: 0.0,
            },
        },
    };
    TaskRecord::new(
        SignedDispatch {
            payload,
            scheduler_signature: "c2lnbmF0dXJl".into(),
        },
        Some(3),
    )
}
