//! Typed stream log over a [`StreamStore`].
//!
//! Records are serialized to JSON on append and decoded on read.
//! Consumer-group registration is remembered per `(stream, group)` so the
//! store sees one create call per pair, until the stream expires and takes
//! its groups with it.

pub mod jobs;
pub mod tasks;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{EntryId, StreamStore};
use crate::telemetry::metrics;

pub use jobs::{JobLifecycleRecord, JobStreamManager};
pub use tasks::{RetryOutcome, StreamInfo, StreamStat, TaskStreamManager};

pub const TASKS_READY: &str = "tasks:ready";
pub const TASKS_PROCESSING: &str = "tasks:processing";
pub const TASKS_COMPLETED: &str = "tasks:completed";
pub const TASKS_FAILED: &str = "tasks:failed";
pub const TASKS_RETRY: &str = "tasks:retry";
pub const JOBS_RUNNING: &str = "jobs:running";
pub const JOBS_COMPLETED: &str = "jobs:completed";

pub struct StreamLog {
    store: Arc<dyn StreamStore>,
    groups: RwLock<HashSet<(String, String)>>,
}

impl StreamLog {
    pub fn new(store: Arc<dyn StreamStore>) -> Self {
        Self {
            store,
            groups: RwLock::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn StreamStore> {
        &self.store
    }

    /// `None` means the stream never expires.
    pub async fn create_if_absent(&self, stream: &str, ttl: Option<Duration>) -> Result<()> {
        self.store.create_stream(stream, ttl).await?;
        record_op(stream, "create");
        Ok(())
    }

    pub async fn append<T: Serialize>(
        &self,
        stream: &str,
        record: &T,
        max_len: usize,
    ) -> Result<EntryId> {
        let payload = serde_json::to_string(record)?;
        let started = Instant::now();
        let id = self.store.append(stream, &payload, max_len).await?;
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "stream.append")],
        );
        record_op(stream, "append");
        Ok(id)
    }

    pub async fn register_group(&self, stream: &str, group: &str) -> Result<()> {
        let key = (stream.to_string(), group.to_string());
        if self.groups.read().await.contains(&key) {
            return Ok(());
        }
        self.store.create_group(stream, group).await?;
        self.groups.write().await.insert(key);
        record_op(stream, "create_group");
        Ok(())
    }

    /// Forget a registration after the store lost the group, then create it
    /// again.
    async fn reregister_group(&self, stream: &str, group: &str) -> Result<()> {
        self.groups
            .write()
            .await
            .remove(&(stream.to_string(), group.to_string()));
        self.register_group(stream, group).await
    }

    /// Read up to `count` undelivered records for `group`, blocking up to
    /// `block`. Registers the group on first use, and again if the stream
    /// expired since.
    ///
    /// Entries that fail to decode are logged and acknowledged so they do
    /// not sit in the pending list forever.
    pub async fn read_batch<T: DeserializeOwned>(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<(EntryId, T)>> {
        self.register_group(stream, group).await?;
        let entries = match self
            .store
            .read_group(stream, group, consumer, count, block)
            .await
        {
            Err(Error::ReadFailed { message, .. }) => {
                debug!(stream, group, %message, "consumer group missing, recreating");
                self.reregister_group(stream, group).await?;
                self.store
                    .read_group(stream, group, consumer, count, block)
                    .await?
            }
            other => other?,
        };
        record_op(stream, if entries.is_empty() { "read_empty" } else { "read" });
        self.decode(stream, group, entries).await
    }

    pub async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        self.store.ack(stream, group, id).await?;
        record_op(stream, "ack");
        Ok(())
    }

    /// Approximate entry count, for observability.
    pub async fn len(&self, stream: &str) -> Result<u64> {
        self.store.len(stream).await
    }

    pub async fn claim_stale<T: DeserializeOwned>(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<(EntryId, T)>> {
        self.register_group(stream, group).await?;
        let entries = match self
            .store
            .claim_stale(stream, group, consumer, min_idle, count)
            .await
        {
            // A recreated group has nothing pending.
            Err(Error::ReadFailed { .. }) => {
                self.reregister_group(stream, group).await?;
                Vec::new()
            }
            other => other?,
        };
        record_op(stream, "claim");
        self.decode(stream, group, entries).await
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        stream: &str,
        group: &str,
        entries: Vec<crate::store::StreamEntry>,
    ) -> Result<Vec<(EntryId, T)>> {
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_str::<T>(&entry.payload) {
                Ok(record) => records.push((entry.id, record)),
                Err(e) => {
                    warn!(stream, entry_id = %entry.id, error = %e, "dropping undecodable stream entry");
                    self.store.ack(stream, group, &entry.id).await?;
                }
            }
        }
        Ok(records)
    }
}

fn record_op(stream: &str, operation: &'static str) {
    metrics::stream_operations().add(
        1,
        &[
            KeyValue::new("stream", stream.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        n: u32,
    }

    #[tokio::test]
    async fn typed_round_trip_through_group() {
        let log = StreamLog::new(Arc::new(MemoryStore::new()));
        log.append("notes", &Note { n: 1 }, 100).await.unwrap();
        let batch: Vec<(EntryId, Note)> = log
            .read_batch("notes", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].1, Note { n: 1 });
    }

    #[tokio::test]
    async fn undecodable_entries_are_skipped_and_acked() {
        let store = Arc::new(MemoryStore::new());
        let log = StreamLog::new(store.clone());
        store.append("notes", "not json", 100).await.unwrap();
        log.append("notes", &Note { n: 2 }, 100).await.unwrap();

        let batch: Vec<(EntryId, Note)> = log
            .read_batch("notes", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(store.pending_count("notes", "g").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reads_survive_stream_expiry() {
        let log = StreamLog::new(Arc::new(MemoryStore::new()));
        log.create_if_absent("notes", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let none: Vec<(EntryId, Note)> = log
            .read_batch("notes", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(none.is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        let after_expiry: Vec<(EntryId, Note)> = log
            .read_batch("notes", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(after_expiry.is_empty());
        let claimed: Vec<(EntryId, Note)> = log
            .claim_stale("notes", "g", "c", Duration::ZERO, 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());

        log.append("notes", &Note { n: 3 }, 100).await.unwrap();
        let batch: Vec<(EntryId, Note)> = log
            .read_batch("notes", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch[0].1, Note { n: 3 });
    }

    #[tokio::test]
    async fn empty_read_is_not_an_error() {
        let log = StreamLog::new(Arc::new(MemoryStore::new()));
        let batch: Vec<(EntryId, Note)> = log
            .read_batch("empty", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }
}
