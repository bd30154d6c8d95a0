//! Error types for trigger-dispatch.

use thiserror::Error;

use crate::model::JobId;

/// Why the downstream task-submission endpoint rejected a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitErrorKind {
    /// The payload was malformed or failed validation downstream.
    InvalidRequest,
    /// The scheduler is not allowed to submit (bad signature, unknown scheduler).
    PermissionDenied,
    /// Network failure, timeout, or a transient downstream failure.
    Transient,
}

impl std::fmt::Display for SubmitErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubmitErrorKind::InvalidRequest => "invalid request",
            SubmitErrorKind::PermissionDenied => "permission denied",
            SubmitErrorKind::Transient => "transient failure",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("append to stream {stream} failed: {message}")]
    AppendFailed { stream: String, message: String },

    #[error("read from stream {stream} failed: {message}")]
    ReadFailed { stream: String, message: String },

    #[error("job {0} is already scheduled")]
    AlreadyScheduled(JobId),

    #[error("maximum number of workers ({max}) reached, cannot schedule job {job_id}")]
    CapacityExceeded { max: usize, job_id: JobId },

    #[error("job {0} is not scheduled")]
    NotScheduled(JobId),

    #[error("unsupported condition type: {0}")]
    InvalidConditionType(String),

    #[error("unsupported value source type: {0}")]
    InvalidSourceType(String),

    #[error("invalid static value: {0}")]
    InvalidStaticValue(String),

    #[error("invalid job definition: {0}")]
    InvalidJob(String),

    #[error("invalid task record: {0}")]
    InvalidTask(String),

    #[error("could not extract numeric value from response: {0}")]
    UnparseableValue(String),

    #[error("job data not found for job {0}")]
    JobDataNotFound(JobId),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("task submission failed ({kind}): {message}")]
    Submit {
        kind: SubmitErrorKind,
        message: String,
    },

    #[error("operation failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether an outbound call that produced this error is worth repeating.
    ///
    /// Validation, permission and lifecycle errors are terminal; transport
    /// failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Submit { kind, .. } => *kind == SubmitErrorKind::Transient,
            Error::Http(e) => !e.status().is_some_and(|s| s.is_client_error()),
            Error::AppendFailed { .. }
            | Error::ReadFailed { .. }
            | Error::Rpc(_)
            | Error::Database(_)
            | Error::Io(_) => true,
            Error::RetriesExhausted { last, .. } => last.is_retryable(),
            _ => false,
        }
    }

    /// Errors that stop the worker that produced them instead of waiting for
    /// the next tick.
    pub fn is_fatal_for_worker(&self) -> bool {
        matches!(
            self,
            Error::InvalidStaticValue(_)
                | Error::InvalidConditionType(_)
                | Error::InvalidSourceType(_)
                | Error::InvalidJob(_)
                | Error::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_errors_follow_kind() {
        let invalid = Error::Submit {
            kind: SubmitErrorKind::InvalidRequest,
            message: "bad payload".into(),
        };
        let denied = Error::Submit {
            kind: SubmitErrorKind::PermissionDenied,
            message: "unknown scheduler".into(),
        };
        let flaky = Error::Submit {
            kind: SubmitErrorKind::Transient,
            message: "connection reset".into(),
        };
        assert!(!invalid.is_retryable());
        assert!(!denied.is_retryable());
        assert!(flaky.is_retryable());
    }

    #[test]
    fn validation_errors_are_terminal() {
        assert!(!Error::InvalidConditionType("sideways".into()).is_retryable());
        let full = Error::CapacityExceeded {
            max: 1,
            job_id: JobId(2),
        };
        assert!(!full.is_retryable());
        assert!(Error::InvalidStaticValue("abc".into()).is_fatal_for_worker());
        assert!(!Error::UnparseableValue("{}".into()).is_fatal_for_worker());
    }
}
