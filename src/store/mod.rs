//! Storage backends for streams and TTL keys.
//!
//! A [`StreamStore`] provides named append-only streams with consumer
//! groups, plus set-if-absent keys with expiry for locks and dedup windows.
//! [`MemoryStore`] runs in-process; [`PgStore`] shares state across
//! scheduler instances through Postgres.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Opaque, store-assigned identifier of a stream entry.
pub type EntryId = String;

/// An entry as delivered to a consumer group.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: EntryId,
    /// Serialized record.
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Create `stream` if it does not exist. With a TTL, the stream expires
    /// when no append happens for that long.
    ///
    /// The TTL is remembered per name: a stream recreated by `append` or
    /// `create_group` after expiring keeps the same retention.
    async fn create_stream(&self, stream: &str, ttl: Option<Duration>) -> Result<()>;

    /// Append `payload`, trimming the stream to roughly `max_len` entries.
    async fn append(&self, stream: &str, payload: &str, max_len: usize) -> Result<EntryId>;

    /// Create a consumer group reading from the start of the stream.
    /// Creates the stream if needed; an existing group is not an error.
    /// Groups are dropped together with an expired stream.
    async fn create_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Deliver up to `count` entries this group has not seen yet, waiting up
    /// to `block` for one to arrive. Times out with an empty batch.
    ///
    /// A missing stream or group is `ReadFailed`.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Mark a delivered entry processed. Acking twice is a no-op.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;

    async fn len(&self, stream: &str) -> Result<u64>;

    /// Reassign to `consumer` entries delivered to this group but left
    /// unacknowledged for at least `min_idle`.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Set `key` only if it is absent or expired. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn delete_key(&self, key: &str) -> Result<()>;

    /// Reset the expiry of `key` to `ttl` from now, only while it still holds
    /// `value`. Returns whether the key was extended.
    async fn extend_key(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if it holds `value`. Returns whether it was deleted.
    async fn delete_key_if(&self, key: &str, value: &str) -> Result<bool>;
}
