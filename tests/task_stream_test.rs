//! Task lifecycle over the in-process stream store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use trigger_dispatch::config::StreamConfig;
use trigger_dispatch::error::{Error, Result};
use trigger_dispatch::event::{BroadcastNotifier, EventKind, NoopNotifier};
use trigger_dispatch::model::{
    DispatchPayload, JobId, SignedDispatch, TaskId, TaskRecord, TaskTarget, TaskTrigger,
    TriggerDetail,
};
use trigger_dispatch::store::{EntryId, MemoryStore, StreamEntry, StreamStore};
use trigger_dispatch::stream::{
    RetryOutcome, StreamLog, TASKS_COMPLETED, TASKS_FAILED, TASKS_PROCESSING, TASKS_READY,
    TASKS_RETRY, TaskStreamManager,
};

fn task(id: i64) -> TaskRecord {
    let payload = DispatchPayload {
        task_id: TaskId(id),
        job_id: JobId(9),
        task_definition_id: 2,
        scheduler_id: 1,
        target: TaskTarget {
            target_chain_id: "84532".into(),
            target_contract_address: "0x98a170b9b24aD4f42B6B3630A54517fd7Ff3Ac6d".into(),
            target_function: "execute".into(),
            abi: None,
            arg_type: None,
            arguments: vec![],
            dynamic_arguments_script_url: None,
        },
        trigger: TaskTrigger {
            triggered_at: Utc::now(),
            detail: TriggerDetail::Event {
                tx_hash: "0xabc".into(),
                chain_id: "11155420".into(),
                contract_address: "0x49a81A591afdDEF973e6e49aaEa7d76943ef234C".into(),
                event_name: "Transfer(address,address,uint256)".into(),
            },
        },
    };
    TaskRecord::new(
        SignedDispatch {
            payload,
            scheduler_signature: "c2ln".into(),
        },
        Some(4),
    )
}

fn config(backoff_base: Duration) -> StreamConfig {
    StreamConfig {
        retry_backoff_base: backoff_base,
        read_block: Duration::from_millis(50),
        ..StreamConfig::default()
    }
}

async fn manager(config: StreamConfig) -> (TaskStreamManager, Arc<StreamLog>) {
    let log = Arc::new(StreamLog::new(Arc::new(MemoryStore::new())));
    let tasks = TaskStreamManager::new(log.clone(), config, Arc::new(NoopNotifier));
    tasks.initialize().await.unwrap();
    (tasks, log)
}

#[tokio::test]
async fn task_moves_through_every_stream() {
    let log = Arc::new(StreamLog::new(Arc::new(MemoryStore::new())));
    let notifier = Arc::new(BroadcastNotifier::new(16));
    let mut events = notifier.subscribe();
    let tasks = TaskStreamManager::new(log.clone(), config(Duration::from_secs(5)), notifier);
    tasks.initialize().await.unwrap();

    tasks.submit_ready(&task(1)).await.unwrap();
    let mut batch = tasks.next_ready("performers", "p4", 10).await.unwrap();
    assert_eq!(batch.len(), 1);
    let (entry, mut record) = batch.remove(0);
    tasks.ack(TASKS_READY, "performers", &entry).await.unwrap();

    tasks.mark_processing(&mut record).await.unwrap();
    assert!(record.processing_started_at.is_some());
    tasks.mark_completed(&mut record).await.unwrap();
    assert!(record.completed_at.is_some());

    assert_eq!(log.len(TASKS_READY).await.unwrap(), 1);
    assert_eq!(log.len(TASKS_PROCESSING).await.unwrap(), 1);
    assert_eq!(log.len(TASKS_COMPLETED).await.unwrap(), 1);

    let kinds: Vec<EventKind> = (0..3).map(|_| events.try_recv().unwrap().kind).collect();
    assert!(matches!(kinds[0], EventKind::TaskReady { performer_id: Some(4), .. }));
    assert!(matches!(kinds[1], EventKind::TaskProcessing { .. }));
    assert!(matches!(kinds[2], EventKind::TaskCompleted { job_id: JobId(9), .. }));
}

#[tokio::test]
async fn retries_count_up_then_fail_terminally() {
    let (tasks, log) = manager(config(Duration::from_secs(5))).await;
    let mut record = task(2);

    let mut previous = None;
    for expected in 1..=2u32 {
        let before = Utc::now();
        match tasks.retry(&mut record, "rpc timeout").await.unwrap() {
            RetryOutcome::Scheduled {
                retry_count,
                scheduled_for,
            } => {
                assert_eq!(retry_count, expected);
                // At least retry_count * base in the future.
                let floor = before + chrono::Duration::seconds(5 * i64::from(expected));
                assert!(scheduled_for >= floor);
                if let Some(prev) = previous {
                    assert!(scheduled_for > prev);
                }
                previous = Some(scheduled_for);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(
        tasks.retry(&mut record, "rpc timeout").await.unwrap(),
        RetryOutcome::Failed { retry_count: 3 }
    );
    assert_eq!(record.last_error.as_deref(), Some("rpc timeout"));
    assert_eq!(log.len(TASKS_RETRY).await.unwrap(), 2);
    assert_eq!(log.len(TASKS_FAILED).await.unwrap(), 1);
}

#[tokio::test]
async fn only_due_retries_are_delivered() {
    let (tasks, log) = manager(config(Duration::ZERO)).await;
    let mut due = task(3);
    tasks.retry(&mut due, "boom").await.unwrap();

    let (slow, _) = manager(config(Duration::from_secs(60))).await;
    let mut later = task(4);
    slow.retry(&mut later, "boom").await.unwrap();
    // Put the not-yet-due copy into the first manager's stream too.
    log.append(TASKS_RETRY, &later, 100).await.unwrap();

    let batch = tasks.next_retry("retriers", "r1", 10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].1.task_id, TaskId(3));

    // The held-back task is still in the stream for a later read.
    assert_eq!(log.len(TASKS_RETRY).await.unwrap(), 3);
    let again = tasks.next_retry("retriers", "r1", 10).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn backoff_never_drops_below_linear_floor() {
    let (tasks, _) = manager(config(Duration::from_millis(200))).await;
    for n in 1..=5u32 {
        let backoff = tasks.compute_backoff(n);
        assert!(backoff >= Duration::from_millis(200) * n);
        assert!(backoff < Duration::from_millis(200) * (n + 1));
    }
}

#[tokio::test]
async fn stale_ready_entries_can_be_reclaimed() {
    let (tasks, _) = manager(config(Duration::from_secs(5))).await;
    tasks.submit_ready(&task(5)).await.unwrap();

    let first = tasks.next_ready("performers", "crashed", 10).await.unwrap();
    assert_eq!(first.len(), 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let reclaimed = tasks
        .reclaim_stale(TASKS_READY, "performers", "healthy", Duration::from_millis(10), 10)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].1.task_id, TaskId(5));
}

#[tokio::test(start_paused = true)]
async fn retry_stream_recovers_after_expiring() {
    let (tasks, log) = manager(config(Duration::ZERO)).await;
    assert!(tasks.next_retry("retriers", "r1", 10).await.unwrap().is_empty());

    // Past the retry stream's 24h TTL: stream and group are gone.
    tokio::time::advance(Duration::from_secs(25 * 60 * 60)).await;
    assert!(tasks.next_retry("retriers", "r1", 10).await.unwrap().is_empty());

    let mut record = task(6);
    tasks.retry(&mut record, "boom").await.unwrap();
    let batch = tasks.next_retry("retriers", "r1", 10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].1.task_id, TaskId(6));

    // The recreated stream still expires.
    tokio::time::advance(Duration::from_secs(25 * 60 * 60)).await;
    assert_eq!(log.len(TASKS_RETRY).await.unwrap(), 0);
}

/// Memory store whose appends can be switched to fail.
#[derive(Default)]
struct FailingAppends {
    inner: MemoryStore,
    failing: AtomicBool,
}

#[async_trait]
impl StreamStore for FailingAppends {
    async fn create_stream(&self, stream: &str, ttl: Option<Duration>) -> Result<()> {
        self.inner.create_stream(stream, ttl).await
    }

    async fn append(&self, stream: &str, payload: &str, max_len: usize) -> Result<EntryId> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::AppendFailed {
                stream: stream.to_string(),
                message: "connection reset".into(),
            });
        }
        self.inner.append(stream, payload, max_len).await
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        self.inner.create_group(stream, group).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        self.inner
            .read_group(stream, group, consumer, count, block)
            .await
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        self.inner.ack(stream, group, id).await
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        self.inner.len(stream).await
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.inner
            .claim_stale(stream, group, consumer, min_idle, count)
            .await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        self.inner.delete_key(key).await
    }

    async fn extend_key(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.inner.extend_key(key, value, ttl).await
    }

    async fn delete_key_if(&self, key: &str, value: &str) -> Result<bool> {
        self.inner.delete_key_if(key, value).await
    }
}

#[tokio::test]
async fn failed_retry_append_does_not_count_an_attempt() {
    let store = Arc::new(FailingAppends::default());
    let log = Arc::new(StreamLog::new(store.clone()));
    let tasks = TaskStreamManager::new(log.clone(), config(Duration::ZERO), Arc::new(NoopNotifier));
    tasks.initialize().await.unwrap();

    let mut record = task(7);
    store.failing.store(true, Ordering::SeqCst);
    let err = tasks.retry(&mut record, "boom").await.unwrap_err();
    assert!(matches!(err, Error::AppendFailed { .. }));
    assert_eq!(record.retry_count, 0);
    assert!(record.last_error.is_none());

    store.failing.store(false, Ordering::SeqCst);
    assert!(matches!(
        tasks.retry(&mut record, "boom").await.unwrap(),
        RetryOutcome::Scheduled { retry_count: 1, .. }
    ));
    assert_eq!(record.retry_count, 1);
    assert_eq!(log.len(TASKS_RETRY).await.unwrap(), 1);
}
