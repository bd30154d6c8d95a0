//! Condition-based scheduler: owns one worker per scheduled job.
//!
//! Jobs are admitted through [`ConditionScheduler::schedule_job`], which
//! validates them, builds the matching monitor and spawns a worker task.
//! Satisfied triggers flow through the [`Dispatcher`], which signs and
//! submits a task. A worker's exit removes it from the job table and moves
//! its `jobs:running` entry to `jobs:completed`.

pub mod dispatch;
pub mod persistence;
pub mod stats;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{SchedulerConfig, StreamConfig};
use crate::error::{Error, Result};
use crate::event::{EventKind, NoopNotifier, Notifier};
use crate::lock::PerformerLock;
use crate::model::{JobId, JobRecord, JobTrigger};
use crate::store::StreamStore;
use crate::stream::{JobLifecycleRecord, JobStreamManager, StreamLog, TaskStreamManager};
use crate::telemetry::metrics;
use crate::worker::{
    ChainClient, ConditionMonitor, EventMonitor, Monitor, SocketMonitor, ValueFetcher,
    WorkerContext, WorkerExit, WorkerState, run_worker,
};

pub use dispatch::{
    EventSource, HmacSigner, HttpSubmitter, NoopEventSource, Signer, StreamSubmitter,
    TaskSubmitter,
};
use dispatch::{DispatchCounters, Dispatcher};
pub use persistence::{JobRepository, MemoryRepository};
pub use stats::{JobStats, SchedulerStats, WorkerCounts};

/// One running worker.
pub(crate) struct WorkerHandle {
    /// Distinguishes this worker from a later one for the same job ID.
    generation: Uuid,
    pub(crate) job: Arc<JobRecord>,
    cancel: CancellationToken,
    state: Arc<RwLock<WorkerState>>,
    started_at: DateTime<Utc>,
    task: JoinHandle<()>,
}

pub(crate) type JobTable = Arc<RwLock<HashMap<JobId, WorkerHandle>>>;

struct Inner {
    config: SchedulerConfig,
    workers: JobTable,
    tasks: Arc<TaskStreamManager>,
    jobs: Arc<JobStreamManager>,
    dispatcher: Arc<Dispatcher>,
    repository: Arc<dyn JobRepository>,
    fetcher: ValueFetcher,
    chains: HashMap<String, Arc<dyn ChainClient>>,
    lock: Option<PerformerLock>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    scheduled: AtomicU64,
}

/// Builds a [`ConditionScheduler`] around a stream store and a signer.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    stream_config: StreamConfig,
    store: Arc<dyn StreamStore>,
    signer: Arc<dyn Signer>,
    repository: Option<Arc<dyn JobRepository>>,
    submitter: Option<Arc<dyn TaskSubmitter>>,
    event_source: Arc<dyn EventSource>,
    notifier: Arc<dyn Notifier>,
    chains: HashMap<String, Arc<dyn ChainClient>>,
    performers: Vec<i64>,
    performer_lock: bool,
}

impl SchedulerBuilder {
    pub fn stream_config(mut self, config: StreamConfig) -> Self {
        self.stream_config = config;
        self
    }

    pub fn repository(mut self, repository: Arc<dyn JobRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Replace the default `tasks:ready` submitter.
    pub fn submitter(mut self, submitter: Arc<dyn TaskSubmitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn event_source(mut self, event_source: Arc<dyn EventSource>) -> Self {
        self.event_source = event_source;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn chain_client(mut self, chain_id: impl Into<String>, client: Arc<dyn ChainClient>) -> Self {
        self.chains.insert(chain_id.into(), client);
        self
    }

    /// Performer IDs for the default submitter's round-robin.
    pub fn performers(mut self, performers: Vec<i64>) -> Self {
        self.performers = performers;
        self
    }

    /// Hold a store-backed lock per job while its worker runs. On by default.
    pub fn performer_lock(mut self, enabled: bool) -> Self {
        self.performer_lock = enabled;
        self
    }

    pub fn build(self) -> Result<ConditionScheduler> {
        let log = Arc::new(StreamLog::new(self.store.clone()));
        let tasks = Arc::new(TaskStreamManager::new(
            log.clone(),
            self.stream_config.clone(),
            self.notifier.clone(),
        ));
        let jobs = Arc::new(JobStreamManager::new(
            log,
            self.stream_config,
            self.notifier.clone(),
        ));
        let submitter = match self.submitter {
            Some(s) => s,
            None => Arc::new(StreamSubmitter::new(tasks.clone(), self.performers)),
        };
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(MemoryRepository::new()));
        let workers: JobTable = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let dispatcher = Arc::new(Dispatcher {
            jobs: workers.clone(),
            config: self.config.clone(),
            store: self.store.clone(),
            repository: repository.clone(),
            signer: self.signer,
            submitter,
            event_source: self.event_source,
            notifier: self.notifier.clone(),
            cancel: cancel.clone(),
            counters: DispatchCounters::default(),
        });
        let lock = self
            .performer_lock
            .then(|| PerformerLock::new(self.store.clone(), self.config.performer_lock_ttl));
        let fetcher = ValueFetcher::new(self.config.request_timeout, self.config.fetch_retry.clone())?;

        Ok(ConditionScheduler {
            inner: Arc::new(Inner {
                config: self.config,
                workers,
                tasks,
                jobs,
                dispatcher,
                repository,
                fetcher,
                chains: self.chains,
                lock,
                notifier: self.notifier,
                cancel,
                started_at: Utc::now(),
                scheduled: AtomicU64::new(0),
            }),
        })
    }
}

#[derive(Clone)]
pub struct ConditionScheduler {
    inner: Arc<Inner>,
}

impl ConditionScheduler {
    pub fn builder(
        config: SchedulerConfig,
        store: Arc<dyn StreamStore>,
        signer: Arc<dyn Signer>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            stream_config: StreamConfig::default(),
            store,
            signer,
            repository: None,
            submitter: None,
            event_source: Arc::new(NoopEventSource),
            notifier: Arc::new(NoopNotifier),
            chains: HashMap::new(),
            performers: vec![1],
            performer_lock: true,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn task_streams(&self) -> &Arc<TaskStreamManager> {
        &self.inner.tasks
    }

    pub fn job_streams(&self) -> &Arc<JobStreamManager> {
        &self.inner.jobs
    }

    /// Create the task and job streams and start the background tickers.
    pub async fn start(&self) -> Result<()> {
        self.inner.tasks.initialize().await?;
        self.inner.jobs.initialize().await?;

        tokio::spawn(stats_loop(self.clone()));
        tokio::spawn(cleanup_loop(self.clone()));
        info!(
            scheduler_id = self.inner.config.scheduler_id,
            max_workers = self.inner.config.max_workers,
            "scheduler started"
        );
        Ok(())
    }

    /// Admit a job and start monitoring it.
    ///
    /// Fails with `AlreadyScheduled`, `CapacityExceeded`, or a validation
    /// error, checked in that order.
    pub async fn schedule_job(&self, job: JobRecord) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let job_id = job.job_id;
        let mut workers = self.inner.workers.write().await;
        if workers.contains_key(&job_id) {
            return Err(Error::AlreadyScheduled(job_id));
        }
        if workers.len() >= self.inner.config.max_workers {
            return Err(Error::CapacityExceeded {
                max: self.inner.config.max_workers,
                job_id,
            });
        }
        job.validate()?;
        let monitor = self.build_monitor(&job)?;

        let job = Arc::new(job);
        let generation = Uuid::new_v4();
        let cancel = self.inner.cancel.child_token();
        let state = Arc::new(RwLock::new(WorkerState::default()));
        let ctx = WorkerContext {
            job: job.clone(),
            state: state.clone(),
            cancel: cancel.clone(),
            handler: self.inner.dispatcher.clone(),
        };

        // The table write lock is held until the handle is inserted, so the
        // worker's exit bookkeeping always finds it.
        let task = tokio::spawn(worker_task(
            self.inner.clone(),
            monitor,
            ctx,
            generation,
        ));
        workers.insert(
            job_id,
            WorkerHandle {
                generation,
                job: job.clone(),
                cancel,
                state,
                started_at: Utc::now(),
                task,
            },
        );
        drop(workers);

        self.inner.scheduled.fetch_add(1, Ordering::Relaxed);
        metrics::jobs_scheduled().add(1, &[KeyValue::new("kind", job.kind().as_str())]);
        self.inner.notifier.notify(EventKind::JobScheduled {
            job_id,
            kind: job.kind(),
        });
        info!(job_id = %job_id, kind = %job.kind(), recurring = job.recurring, "job scheduled");
        Ok(())
    }

    /// Load a job from the repository and schedule it.
    pub async fn schedule_by_id(&self, job_id: JobId) -> Result<()> {
        let job = self.inner.repository.get_job_by_id(job_id).await?;
        self.schedule_job(job).await
    }

    /// Stop monitoring a job. Fails with `NotScheduled` if it is not running.
    ///
    /// Returns once the worker has released its performer lock and recorded
    /// its completion, or after `request_timeout`, so the same job can be
    /// scheduled again straight away.
    pub async fn unschedule_job(&self, job_id: JobId) -> Result<()> {
        let handle = {
            let mut workers = self.inner.workers.write().await;
            workers.remove(&job_id).ok_or(Error::NotScheduled(job_id))?
        };
        handle.cancel.cancel();
        match tokio::time::timeout(self.inner.config.request_timeout, handle.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(job_id = %job_id, error = %e, "worker task panicked"),
            Err(_) => warn!(job_id = %job_id, "worker still stopping after unschedule"),
        }
        info!(job_id = %job_id, "job unscheduled");
        Ok(())
    }

    pub async fn is_scheduled(&self, job_id: JobId) -> bool {
        self.inner.workers.read().await.contains_key(&job_id)
    }

    pub async fn active_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.inner.workers.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn get_job_stats(&self, job_id: JobId) -> Result<JobStats> {
        let (job, state, started_at) = {
            let workers = self.inner.workers.read().await;
            let handle = workers.get(&job_id).ok_or(Error::NotScheduled(job_id))?;
            (handle.job.clone(), handle.state.clone(), handle.started_at)
        };
        let state = state.read().await.clone();
        Ok(JobStats {
            job_id,
            kind: job.kind(),
            recurring: job.recurring,
            expiration_time: job.expiration_time,
            started_at,
            state,
        })
    }

    pub async fn get_stats(&self) -> Result<SchedulerStats> {
        let workers = self.worker_counts().await;
        let counters = &self.inner.dispatcher.counters;
        let now = Utc::now();
        Ok(SchedulerStats {
            scheduler_id: self.inner.config.scheduler_id,
            started_at: self.inner.started_at,
            uptime_secs: (now - self.inner.started_at).num_seconds(),
            max_workers: self.inner.config.max_workers,
            workers,
            jobs_scheduled: self.inner.scheduled.load(Ordering::Relaxed),
            tasks_dispatched: counters.dispatched.load(Ordering::Relaxed),
            duplicate_triggers: counters.duplicates.load(Ordering::Relaxed),
            dispatch_failures: counters.failures.load(Ordering::Relaxed),
            jobs_running: self.inner.jobs.running_len().await?,
            jobs_completed: self.inner.jobs.completed_len().await?,
            streams: self.inner.tasks.stream_info().await?,
        })
    }

    /// Cancel every worker and wait up to `grace` for them to finish.
    pub async fn shutdown(&self, grace: Duration) {
        info!("scheduler shutting down");
        self.inner.cancel.cancel();
        let handles: Vec<(JobId, JoinHandle<()>)> = self
            .inner
            .workers
            .write()
            .await
            .drain()
            .map(|(id, h)| (id, h.task))
            .collect();

        let stopped = tokio::time::timeout(grace, async {
            for (job_id, task) in handles {
                if let Err(e) = task.await {
                    warn!(job_id = %job_id, error = %e, "worker task panicked");
                }
            }
        })
        .await;
        if stopped.is_err() {
            warn!(grace_secs = grace.as_secs(), "workers still running after shutdown grace period");
        }
        info!("scheduler stopped");
    }

    async fn worker_counts(&self) -> WorkerCounts {
        let mut counts = WorkerCounts::default();
        for handle in self.inner.workers.read().await.values() {
            counts.add(handle.job.kind());
        }
        counts
    }

    fn build_monitor(&self, job: &JobRecord) -> Result<Box<dyn Monitor>> {
        let config = &self.inner.config;
        Ok(match &job.trigger {
            JobTrigger::Condition(spec) => Box::new(ConditionMonitor::new(
                spec.clone(),
                self.inner.fetcher.clone(),
                config.condition_poll_interval,
            )?),
            JobTrigger::Event(spec) => {
                let client = self
                    .inner
                    .chains
                    .get(&spec.trigger_chain_id)
                    .cloned()
                    .ok_or_else(|| {
                        Error::InvalidJob(format!(
                            "no RPC endpoint configured for chain {}",
                            spec.trigger_chain_id
                        ))
                    })?;
                Box::new(EventMonitor::new(
                    spec.clone(),
                    client,
                    config.event_poll_interval,
                    config.max_block_range,
                ))
            }
            JobTrigger::Socket(spec) => Box::new(SocketMonitor::new(
                spec.clone(),
                config.condition_poll_interval,
            )?),
        })
    }
}

/// Body of every spawned worker: bookkeeping around [`run_worker`].
async fn worker_task(
    inner: Arc<Inner>,
    monitor: Box<dyn Monitor>,
    ctx: WorkerContext,
    generation: Uuid,
) {
    let job_id = ctx.job.job_id;
    let record = JobLifecycleRecord::running(&ctx.job);
    let running_entry = match inner.jobs.add_running(&record).await {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "failed to record running job");
            None
        }
    };

    let exit = run_worker(monitor, ctx, inner.lock.clone()).await;
    if let WorkerExit::Failed(error) = &exit {
        warn!(job_id = %job_id, %error, "worker failed");
    }
    metrics::jobs_unscheduled().add(1, &[KeyValue::new("reason", exit.reason().to_string())]);

    if let Some(entry) = running_entry {
        if let Err(e) = inner.jobs.move_to_completed(record, &entry, exit.reason()).await {
            warn!(job_id = %job_id, error = %e, "failed to record completed job");
        }
    }

    // A later worker may already own this ID after an unschedule.
    let mut workers = inner.workers.write().await;
    if workers.get(&job_id).is_some_and(|h| h.generation == generation) {
        workers.remove(&job_id);
    }
}

async fn stats_loop(scheduler: ConditionScheduler) {
    let mut tick = tokio::time::interval(scheduler.inner.config.stats_interval);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = scheduler.inner.cancel.cancelled() => return,
            _ = tick.tick() => {}
        }
        let counts = scheduler.worker_counts().await;
        let counters = &scheduler.inner.dispatcher.counters;
        info!(
            active = counts.total(),
            condition = counts.condition,
            event = counts.event,
            socket = counts.socket,
            max = scheduler.inner.config.max_workers,
            dispatched = counters.dispatched.load(Ordering::Relaxed),
            failures = counters.failures.load(Ordering::Relaxed),
            "scheduler stats"
        );
    }
}

/// Drops table entries whose worker task ended without cleaning up.
async fn cleanup_loop(scheduler: ConditionScheduler) {
    let mut tick = tokio::time::interval(scheduler.inner.config.cleanup_interval);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = scheduler.inner.cancel.cancelled() => return,
            _ = tick.tick() => {}
        }
        let removed = {
            let mut workers = scheduler.inner.workers.write().await;
            let before = workers.len();
            workers.retain(|_, h| !h.task.is_finished());
            before - workers.len()
        };
        if removed > 0 {
            warn!(removed, "removed finished workers from job table");
        } else {
            debug!("job table clean");
        }
    }
}
