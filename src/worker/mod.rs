//! Per-job workers and the supervisor loop that drives them.
//!
//! A worker is a [`Monitor`] plus shared [`WorkerState`]. The supervisor
//! waits for the monitor's next tick, checks expiry, then lets the monitor
//! check its trigger. The monitor reports a [`PollOutcome`]; stopping is
//! decided here, never from inside the monitor.

pub mod condition;
pub mod event;
pub mod socket;
pub mod value;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::Result;
use crate::lock::{Lease, PerformerLock};
use crate::model::{JobId, JobRecord, TriggerDetail};
use crate::telemetry::metrics;
use crate::telemetry::spans::start_job_span;

pub use condition::ConditionMonitor;
pub use event::{ChainClient, EventMonitor, JsonRpcClient, LogFilter, RpcLog};
pub use socket::SocketMonitor;
pub use value::{ValueFetcher, extract_value};

/// A satisfied trigger, handed from a worker to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerNotification {
    pub job_id: JobId,
    pub triggered_at: DateTime<Utc>,
    pub detail: TriggerDetail,
}

impl TriggerNotification {
    /// The value that satisfied a condition or socket trigger.
    pub fn trigger_value(&self) -> Option<f64> {
        match self.detail {
            TriggerDetail::Condition {
                satisfied_value, ..
            }
            | TriggerDetail::Socket {
                satisfied_value, ..
            } => Some(satisfied_value),
            TriggerDetail::Event { .. } => None,
        }
    }
}

/// Receives satisfied triggers.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn on_trigger(&self, notification: TriggerNotification) -> Result<()>;
}

/// What one check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Continue,
    /// Triggered a non-recurring job.
    SatisfiedStop,
    ExpiredStop,
}

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Expired,
    Triggered,
    Cancelled,
    /// Another holder owns this job's performer lock.
    LockHeld,
    /// The performer lock expired or was taken over while running.
    LockLost,
    Failed(String),
}

impl WorkerExit {
    pub fn reason(&self) -> &str {
        match self {
            WorkerExit::Expired => "expired",
            WorkerExit::Triggered => "triggered",
            WorkerExit::Cancelled => "unscheduled",
            WorkerExit::LockHeld => "lock_held",
            WorkerExit::LockLost => "lock_lost",
            WorkerExit::Failed(_) => "failed",
        }
    }
}

/// Observable worker state, shared with the scheduler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerState {
    pub is_active: bool,
    pub last_value: Option<f64>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_block: Option<u64>,
    /// Consecutive satisfied checks; reset by any unsatisfied one.
    pub condition_met_count: u64,
    pub trigger_count: u64,
    pub last_error: Option<String>,
}

/// Everything a monitor may touch while checking.
pub struct WorkerContext {
    pub job: Arc<JobRecord>,
    pub state: Arc<RwLock<WorkerState>>,
    pub cancel: CancellationToken,
    pub handler: Arc<dyn TriggerHandler>,
}

impl WorkerContext {
    /// Record a satisfied check, notify the handler, and decide whether to stop.
    pub async fn fire(&self, notification: TriggerNotification) -> PollOutcome {
        {
            let mut state = self.state.write().await;
            state.condition_met_count += 1;
            state.trigger_count += 1;
        }
        let job_id = notification.job_id;
        if let Err(e) = self.handler.on_trigger(notification).await {
            error!(job_id = %job_id, error = %e, "trigger handoff failed");
        }
        if self.job.recurring {
            PollOutcome::Continue
        } else {
            PollOutcome::SatisfiedStop
        }
    }

    pub async fn record_unsatisfied(&self) {
        self.state.write().await.condition_met_count = 0;
    }
}

#[async_trait]
pub trait Monitor: Send {
    /// Short label for metrics and logs.
    fn source(&self) -> &'static str;

    /// Wait until the next check is due. An error here ends the worker.
    async fn wait(&mut self, ctx: &WorkerContext) -> Result<()>;

    /// Run one check. Errors are logged and the worker keeps going unless
    /// [`crate::error::Error::is_fatal_for_worker`] says otherwise.
    async fn check(&mut self, ctx: &WorkerContext) -> Result<PollOutcome>;
}

/// Drive `monitor` until the job expires, triggers (non-recurring), is
/// cancelled, or fails.
///
/// When `lock` is given, the job's performer lock is held for the whole run,
/// renewed every third of its TTL, and released on every exit path. Losing
/// it stops the worker.
pub async fn run_worker(
    mut monitor: Box<dyn Monitor>,
    ctx: WorkerContext,
    lock: Option<PerformerLock>,
) -> WorkerExit {
    let job_id = ctx.job.job_id;
    let span = start_job_span(job_id, ctx.job.kind());

    async move {
        let lock_id = format!("job-{job_id}");
        let guard = match &lock {
            Some(lock) => match lock.try_lock(&lock_id).await {
                Ok(Some(guard)) => Some(guard),
                Ok(None) => {
                    warn!(job_id = %job_id, "job is already monitored elsewhere, stopping");
                    return WorkerExit::LockHeld;
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "performer lock unavailable, monitoring unlocked");
                    None
                }
            },
            None => None,
        };

        let lost = CancellationToken::new();
        let stop_heartbeat = CancellationToken::new();
        let heartbeat = match (&lock, guard.as_ref().and_then(|g| g.lease())) {
            (Some(lock), Some(lease)) => Some(tokio::spawn(
                heartbeat(lease, lock.ttl(), stop_heartbeat.clone(), lost.clone())
                    .in_current_span(),
            )),
            _ => None,
        };

        ctx.state.write().await.is_active = true;
        metrics::workers_active().add(1, &[]);
        info!(job_id = %job_id, source = monitor.source(), "worker started");

        let exit = supervise(monitor.as_mut(), &ctx, &lost).await;

        ctx.state.write().await.is_active = false;
        metrics::workers_active().add(-1, &[]);
        stop_heartbeat.cancel();
        if let Some(heartbeat) = heartbeat {
            if let Err(e) = heartbeat.await {
                warn!(job_id = %job_id, error = %e, "lock heartbeat panicked");
            }
        }
        if let Some(guard) = guard {
            if let Err(e) = guard.release().await {
                warn!(job_id = %job_id, error = %e, "failed to release performer lock");
            }
        }
        info!(job_id = %job_id, reason = exit.reason(), "worker stopped");
        exit
    }
    .instrument(span)
    .await
}

/// Keep `lease` alive until `stop`; cancels `lost` if another holder has it.
async fn heartbeat(lease: Lease, ttl: Duration, stop: CancellationToken, lost: CancellationToken) {
    let every = (ttl / 3).max(Duration::from_millis(10));
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        match lease.refresh().await {
            Ok(true) => debug!(key = lease.key(), "performer lock renewed"),
            Ok(false) => {
                warn!(key = lease.key(), "performer lock lost");
                lost.cancel();
                return;
            }
            Err(e) => warn!(key = lease.key(), error = %e, "performer lock renewal failed, will retry"),
        }
    }
}

async fn supervise(
    monitor: &mut dyn Monitor,
    ctx: &WorkerContext,
    lost: &CancellationToken,
) -> WorkerExit {
    loop {
        let waited = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return WorkerExit::Cancelled,
            _ = lost.cancelled() => return WorkerExit::LockLost,
            r = monitor.wait(ctx) => r,
        };
        if let Err(e) = waited {
            error!(job_id = %ctx.job.job_id, error = %e, "worker source failed");
            return WorkerExit::Failed(e.to_string());
        }

        if ctx.job.is_expired(Utc::now()) {
            return WorkerExit::Expired;
        }

        let checked = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return WorkerExit::Cancelled,
            _ = lost.cancelled() => return WorkerExit::LockLost,
            r = monitor.check(ctx) => r,
        };
        match checked {
            Ok(PollOutcome::Continue) => {}
            Ok(PollOutcome::SatisfiedStop) => return WorkerExit::Triggered,
            Ok(PollOutcome::ExpiredStop) => return WorkerExit::Expired,
            Err(e) if e.is_fatal_for_worker() => {
                error!(job_id = %ctx.job.job_id, error = %e, "worker check failed fatally");
                return WorkerExit::Failed(e.to_string());
            }
            Err(e) => {
                warn!(job_id = %ctx.job.job_id, error = %e, "check failed, will retry next tick");
                ctx.state.write().await.last_error = Some(e.to_string());
            }
        }
    }
}

pub(crate) fn record_check(source: &'static str, satisfied: bool) {
    debug!(source, satisfied, "trigger checked");
    metrics::conditions_checked().add(
        1,
        &[
            KeyValue::new("source", source),
            KeyValue::new("satisfied", satisfied),
        ],
    );
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::error::Error;
    use crate::lock::performer_key;
    use crate::model::{ConditionSpec, JobTrigger, TaskTarget};
    use crate::store::{MemoryStore, StreamStore};

    /// Replays a script of check results, one per tick, then continues.
    struct Scripted {
        script: VecDeque<Result<PollOutcome>>,
        tick: Duration,
    }

    #[async_trait]
    impl Monitor for Scripted {
        fn source(&self) -> &'static str {
            "scripted"
        }

        async fn wait(&mut self, _ctx: &WorkerContext) -> Result<()> {
            if self.tick.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.tick).await;
            }
            Ok(())
        }

        async fn check(&mut self, _ctx: &WorkerContext) -> Result<PollOutcome> {
            self.script.pop_front().unwrap_or(Ok(PollOutcome::Continue))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TriggerNotification>>);

    #[async_trait]
    impl TriggerHandler for Recorder {
        async fn on_trigger(&self, n: TriggerNotification) -> Result<()> {
            self.0.lock().unwrap().push(n);
            Err(Error::Other("downstream unavailable".into()))
        }
    }

    fn context(recurring: bool, expires_in: chrono::Duration) -> (WorkerContext, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let job = JobRecord {
            job_id: JobId(1),
            task_definition_id: 1,
            expiration_time: Utc::now() + expires_in,
            recurring,
            target: TaskTarget::for_tests(),
            trigger: JobTrigger::Condition(ConditionSpec {
                condition_type: "equals".into(),
                upper_limit: 0.0,
                lower_limit: 1.0,
                value_source_type: "static".into(),
                value_source_url: "1".into(),
                selected_key_route: None,
            }),
        };
        let ctx = WorkerContext {
            job: Arc::new(job),
            state: Arc::new(RwLock::new(WorkerState::default())),
            cancel: CancellationToken::new(),
            handler: recorder.clone(),
        };
        (ctx, recorder)
    }

    fn scripted(script: Vec<Result<PollOutcome>>) -> Box<dyn Monitor> {
        Box::new(Scripted {
            script: script.into(),
            tick: Duration::ZERO,
        })
    }

    fn ticking(every: Duration) -> Box<dyn Monitor> {
        Box::new(Scripted {
            script: VecDeque::new(),
            tick: every,
        })
    }

    #[tokio::test]
    async fn transient_errors_are_recorded_and_skipped() {
        let (ctx, _) = context(false, chrono::Duration::hours(1));
        let state = ctx.state.clone();
        let exit = run_worker(
            scripted(vec![
                Err(Error::Rpc("node down".into())),
                Ok(PollOutcome::Continue),
                Ok(PollOutcome::SatisfiedStop),
            ]),
            ctx,
            None,
        )
        .await;
        assert_eq!(exit, WorkerExit::Triggered);
        let state = state.read().await;
        assert!(!state.is_active);
        assert!(state.last_error.as_deref().is_some_and(|e| e.contains("node down")));
    }

    #[tokio::test]
    async fn fatal_errors_end_the_worker() {
        let (ctx, _) = context(true, chrono::Duration::hours(1));
        let exit = run_worker(
            scripted(vec![Err(Error::InvalidStaticValue("abc".into()))]),
            ctx,
            None,
        )
        .await;
        assert!(matches!(exit, WorkerExit::Failed(_)));
    }

    #[tokio::test]
    async fn expiry_is_checked_before_the_trigger() {
        let (ctx, _) = context(false, chrono::Duration::seconds(-1));
        let exit = run_worker(scripted(vec![Ok(PollOutcome::SatisfiedStop)]), ctx, None).await;
        assert_eq!(exit, WorkerExit::Expired);
    }

    #[tokio::test]
    async fn cancellation_stops_the_worker() {
        let (ctx, _) = context(true, chrono::Duration::hours(1));
        ctx.cancel.cancel();
        let exit = run_worker(scripted(vec![]), ctx, None).await;
        assert_eq!(exit, WorkerExit::Cancelled);
    }

    #[tokio::test]
    async fn fire_stops_non_recurring_even_when_handoff_fails() {
        let (ctx, recorder) = context(false, chrono::Duration::hours(1));
        let n = TriggerNotification {
            job_id: JobId(1),
            triggered_at: Utc::now(),
            detail: TriggerDetail::Socket {
                satisfied_value: 3.0,
                condition_type: "equals".into(),
                socket_url: "ws://feed".into(),
            },
        };
        assert_eq!(n.trigger_value(), Some(3.0));
        assert_eq!(ctx.fire(n).await, PollOutcome::SatisfiedStop);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
        let state = ctx.state.read().await;
        assert_eq!(state.trigger_count, 1);
        assert_eq!(state.condition_met_count, 1);
    }

    #[tokio::test]
    async fn recurring_jobs_continue_after_firing() {
        let (ctx, _) = context(true, chrono::Duration::hours(1));
        let n = TriggerNotification {
            job_id: JobId(1),
            triggered_at: Utc::now(),
            detail: TriggerDetail::Event {
                tx_hash: "0x1".into(),
                chain_id: "1".into(),
                contract_address: "0x2".into(),
                event_name: "Ping()".into(),
            },
        };
        assert_eq!(n.trigger_value(), None);
        assert_eq!(ctx.fire(n).await, PollOutcome::Continue);
        ctx.record_unsatisfied().await;
        assert_eq!(ctx.state.read().await.condition_met_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn job_lock_is_renewed_for_the_whole_run() {
        let store = Arc::new(MemoryStore::new());
        let lock = PerformerLock::new(store.clone(), Duration::from_secs(15 * 60));
        let (ctx, _) = context(true, chrono::Duration::days(2));
        let cancel = ctx.cancel.clone();
        let worker = tokio::spawn(run_worker(ticking(Duration::from_secs(1)), ctx, Some(lock.clone())));

        tokio::time::sleep(Duration::from_secs(16 * 60)).await;
        assert!(!worker.is_finished());
        assert!(lock.try_lock("job-1").await.unwrap().is_none());

        cancel.cancel();
        assert_eq!(worker.await.unwrap(), WorkerExit::Cancelled);
        assert!(store.get_key(&performer_key("job-1")).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn losing_the_job_lock_stops_the_worker() {
        let store = Arc::new(MemoryStore::new());
        let lock = PerformerLock::new(store.clone(), Duration::from_secs(60));
        let (ctx, _) = context(true, chrono::Duration::days(2));
        let worker = tokio::spawn(run_worker(ticking(Duration::from_secs(1)), ctx, Some(lock)));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let key = performer_key("job-1");
        store.delete_key(&key).await.unwrap();
        assert!(store
            .set_if_absent(&key, "other-scheduler", Duration::from_secs(600))
            .await
            .unwrap());

        assert_eq!(worker.await.unwrap(), WorkerExit::LockLost);
        // The new holder's key survives the old worker's release.
        assert_eq!(store.get_key(&key).await.as_deref(), Some("other-scheduler"));
    }
}
