//! Trigger handoff: sign a task for a satisfied trigger and submit it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use opentelemetry::KeyValue;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::JobTable;
use super::persistence::JobRepository;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result, SubmitErrorKind};
use crate::event::{EventKind, Notifier};
use crate::model::{
    DispatchPayload, JobId, SignedDispatch, TaskId, TaskRecord, TaskTrigger, TriggerDetail,
};
use crate::store::StreamStore;
use crate::stream::TaskStreamManager;
use crate::telemetry::metrics;
use crate::worker::{TriggerHandler, TriggerNotification};

/// Duplicate-window key for a trigger.
///
/// Value triggers share one key per job, so a condition that stays satisfied
/// fires at most once per window. Event triggers are keyed by transaction,
/// so distinct logs each dispatch and only a re-reported log is dropped.
pub fn dedup_key(n: &TriggerNotification) -> String {
    match &n.detail {
        TriggerDetail::Event { tx_hash, .. } => format!("trigger:dedup:{}:{tx_hash}", n.job_id),
        TriggerDetail::Condition { .. } | TriggerDetail::Socket { .. } => {
            format!("trigger:dedup:{}", n.job_id)
        }
    }
}

/// Produces the scheduler signature over a dispatch payload.
pub trait Signer: Send + Sync {
    fn sign(&self, message: &[u8]) -> Result<String>;
}

/// HMAC-SHA256 keyed by the scheduler's secret, base64 encoded.
pub struct HmacSigner {
    key: SecretString,
}

impl HmacSigner {
    pub fn new(key: SecretString) -> Self {
        Self { key }
    }

    pub fn verify(&self, message: &[u8], signature: &str) -> bool {
        let Ok(raw) = STANDARD.decode(signature) else {
            return false;
        };
        match Hmac::<Sha256>::new_from_slice(self.key.expose_secret().as_bytes()) {
            Ok(mut mac) => {
                mac.update(message);
                mac.verify_slice(&raw).is_ok()
            }
            Err(_) => false,
        }
    }
}

impl Signer for HmacSigner {
    fn sign(&self, message: &[u8]) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.key.expose_secret().as_bytes())
            .map_err(|e| Error::Config(format!("invalid signing key: {e}")))?;
        mac.update(message);
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

/// Where signed tasks go.
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    async fn submit(&self, dispatch: &SignedDispatch) -> Result<()>;
}

/// Submits straight into `tasks:ready`, assigning performers round-robin.
pub struct StreamSubmitter {
    tasks: Arc<TaskStreamManager>,
    performers: Vec<i64>,
    next: AtomicUsize,
}

impl StreamSubmitter {
    pub fn new(tasks: Arc<TaskStreamManager>, performers: Vec<i64>) -> Self {
        Self {
            tasks,
            performers,
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TaskSubmitter for StreamSubmitter {
    async fn submit(&self, dispatch: &SignedDispatch) -> Result<()> {
        if self.performers.is_empty() {
            return Err(Error::Submit {
                kind: SubmitErrorKind::InvalidRequest,
                message: "no performers configured".into(),
            });
        }
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.performers.len();
        let task = TaskRecord::new(dispatch.clone(), Some(self.performers[slot]));
        self.tasks.submit_ready(&task).await?;
        Ok(())
    }
}

/// POSTs the signed dispatch as JSON to a downstream endpoint.
pub struct HttpSubmitter {
    client: reqwest::Client,
    url: String,
}

impl HttpSubmitter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }
}

/// Map a rejected submission to its error kind.
pub fn classify_rejection(status: reqwest::StatusCode, body: &str) -> SubmitErrorKind {
    let lowered = body.to_lowercase();
    match status.as_u16() {
        400 | 422 => SubmitErrorKind::InvalidRequest,
        401 | 403 => SubmitErrorKind::PermissionDenied,
        _ if lowered.contains("permission denied") => SubmitErrorKind::PermissionDenied,
        _ if lowered.contains("invalid") => SubmitErrorKind::InvalidRequest,
        _ => SubmitErrorKind::Transient,
    }
}

#[async_trait]
impl TaskSubmitter for HttpSubmitter {
    async fn submit(&self, dispatch: &SignedDispatch) -> Result<()> {
        let resp = self.client.post(&self.url).json(dispatch).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::Submit {
            kind: classify_rejection(status, &body),
            message: format!("{status}: {body}"),
        })
    }
}

/// Told when a job stops needing its external event subscription.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn unregister(&self, job_id: JobId) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopEventSource;

#[async_trait]
impl EventSource for NoopEventSource {
    async fn unregister(&self, _job_id: JobId) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct DispatchCounters {
    pub dispatched: AtomicU64,
    pub duplicates: AtomicU64,
    pub failures: AtomicU64,
}

/// The scheduler's [`TriggerHandler`].
pub(crate) struct Dispatcher {
    pub(crate) jobs: JobTable,
    pub(crate) config: SchedulerConfig,
    pub(crate) store: Arc<dyn StreamStore>,
    pub(crate) repository: Arc<dyn JobRepository>,
    pub(crate) signer: Arc<dyn Signer>,
    pub(crate) submitter: Arc<dyn TaskSubmitter>,
    pub(crate) event_source: Arc<dyn EventSource>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) cancel: CancellationToken,
    pub(crate) counters: DispatchCounters,
}

impl Dispatcher {
    /// Returns `Ok(None)` when the trigger was a duplicate.
    async fn dispatch(&self, n: TriggerNotification) -> Result<Option<TaskId>> {
        let job = {
            let table = self.jobs.read().await;
            table
                .get(&n.job_id)
                .map(|h| h.job.clone())
                .ok_or(Error::JobDataNotFound(n.job_id))?
        };

        if !self.config.duplicate_window.is_zero() {
            match self
                .store
                .set_if_absent(&dedup_key(&n), "1", self.config.duplicate_window)
                .await
            {
                Ok(true) => {}
                Ok(false) => return Ok(None),
                Err(e) => warn!(job_id = %job.job_id, error = %e, "dedup check failed, dispatching anyway"),
            }
        }

        let task_id = self.repository.assign_next_task_id(job.job_id).await?;
        let payload = DispatchPayload {
            task_id,
            job_id: job.job_id,
            task_definition_id: job.task_definition_id,
            scheduler_id: self.config.scheduler_id,
            target: job.target.clone(),
            trigger: TaskTrigger {
                triggered_at: n.triggered_at,
                detail: n.detail,
            },
        };
        let signature = self.signer.sign(&payload.signing_bytes()?)?;
        let signed = SignedDispatch {
            payload,
            scheduler_signature: signature,
        };

        self.config
            .dispatch_retry
            .execute(&self.cancel, || self.submitter.submit(&signed))
            .await?;

        self.notifier.notify(EventKind::JobTriggered {
            job_id: job.job_id,
            task_id,
        });
        if !job.recurring {
            if let Err(e) = self.event_source.unregister(job.job_id).await {
                warn!(job_id = %job.job_id, error = %e, "failed to unregister job from event source");
            }
        }
        Ok(Some(task_id))
    }
}

#[async_trait]
impl TriggerHandler for Dispatcher {
    async fn on_trigger(&self, notification: TriggerNotification) -> Result<()> {
        let job_id = notification.job_id;
        let value = notification.trigger_value();
        let result = match self.dispatch(notification).await {
            Ok(Some(task_id)) => {
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                info!(job_id = %job_id, task_id = %task_id, ?value, "task dispatched");
                Ok("ok")
            }
            Ok(None) => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(job_id = %job_id, "duplicate trigger dropped");
                Ok("duplicate")
            }
            // The job was unscheduled while its trigger was in flight.
            Err(Error::JobDataNotFound(_)) => {
                debug!(job_id = %job_id, "trigger for unscheduled job dropped");
                Ok("stale")
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        };
        let label = match &result {
            Ok(label) => *label,
            Err(_) => "error",
        };
        metrics::triggers_dispatched().add(1, &[KeyValue::new("result", label)]);
        result.map(|_| ())
    }
}
