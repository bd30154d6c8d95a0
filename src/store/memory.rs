//! In-process stream store.
//!
//! Used by tests and single-node deployments. Expiry runs on the tokio
//! clock so paused-time tests can step through TTLs.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{EntryId, StreamEntry, StreamStore};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    id: EntryId,
    payload: String,
    created_at: DateTime<Utc>,
}

impl Entry {
    fn to_stream_entry(&self) -> StreamEntry {
        StreamEntry {
            id: self.id.clone(),
            payload: self.payload.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug)]
struct Pending {
    entry: Entry,
    consumer: String,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: u64,
    pending: HashMap<EntryId, Pending>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: VecDeque<Entry>,
    groups: HashMap<String, Group>,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct Key {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<String, Stream>,
    /// Retention per stream name; outlives the stream itself.
    ttls: HashMap<String, Duration>,
    keys: HashMap<String, Key>,
    next_seq: u64,
}

impl Inner {
    fn purge_expired(&mut self, now: Instant) {
        self.streams
            .retain(|_, s| s.expires_at.is_none_or(|at| at > now));
        self.keys.retain(|_, k| k.expires_at > now);
    }

    /// The named stream, created with its remembered TTL if absent.
    fn stream_mut(&mut self, name: &str, now: Instant) -> &mut Stream {
        let ttl = self.ttls.get(name).copied();
        self.streams.entry(name.to_string()).or_insert_with(|| Stream {
            ttl,
            expires_at: ttl.map(|ttl| now + ttl),
            ..Stream::default()
        })
    }
}

/// Stream store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    appended: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a live key, for inspection in tests and tooling.
    pub async fn get_key(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(Instant::now());
        inner.keys.get(key).map(|k| k.value.clone())
    }

    /// Number of delivered-but-unacknowledged entries for a group.
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    fn read_failed(stream: &str, message: impl Into<String>) -> Error {
        Error::ReadFailed {
            stream: stream.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn create_stream(&self, stream: &str, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.purge_expired(now);
        if let Some(ttl) = ttl {
            inner.ttls.insert(stream.to_string(), ttl);
        }
        inner.stream_mut(stream, now);
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &str, max_len: usize) -> Result<EntryId> {
        let now = Instant::now();
        let id = {
            let mut inner = self.inner.lock().await;
            inner.purge_expired(now);
            inner.next_seq += 1;
            let seq = inner.next_seq;
            let created_at = Utc::now();
            let id = format!("{}-{seq}", created_at.timestamp_millis());

            let s = inner.stream_mut(stream, now);
            s.entries.push_back(Entry {
                seq,
                id: id.clone(),
                payload: payload.to_string(),
                created_at,
            });
            if max_len > 0 {
                while s.entries.len() > max_len {
                    s.entries.pop_front();
                }
            }
            if let Some(ttl) = s.ttl {
                s.expires_at = Some(now + ttl);
            }
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.purge_expired(now);
        inner
            .stream_mut(stream, now)
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            // Registered before checking so an append in between still wakes us.
            let appended = self.appended.notified();
            {
                let now = Instant::now();
                let mut inner = self.inner.lock().await;
                inner.purge_expired(now);
                let s = inner
                    .streams
                    .get_mut(stream)
                    .ok_or_else(|| Self::read_failed(stream, "no such stream"))?;
                let g = s
                    .groups
                    .get_mut(group)
                    .ok_or_else(|| Self::read_failed(stream, format!("no such group {group}")))?;

                let batch: Vec<Entry> = s
                    .entries
                    .iter()
                    .filter(|e| e.seq > g.last_delivered)
                    .take(count)
                    .cloned()
                    .collect();

                if let Some(last) = batch.last() {
                    g.last_delivered = last.seq;
                    for entry in &batch {
                        g.pending.insert(
                            entry.id.clone(),
                            Pending {
                                entry: entry.clone(),
                                consumer: consumer.to_string(),
                                delivered_at: now,
                            },
                        );
                    }
                    return Ok(batch.iter().map(Entry::to_stream_entry).collect());
                }
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = appended => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(g) = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            g.pending.remove(id);
        }
        Ok(())
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(Instant::now());
        Ok(inner
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len() as u64))
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.purge_expired(now);
        let g = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| Self::read_failed(stream, format!("no such group {group}")))?;

        let mut stale: Vec<&mut Pending> = g
            .pending
            .values_mut()
            .filter(|p| now.duration_since(p.delivered_at) >= min_idle)
            .collect();
        stale.sort_by_key(|p| p.entry.seq);

        Ok(stale
            .into_iter()
            .take(count)
            .map(|p| {
                p.consumer = consumer.to_string();
                p.delivered_at = now;
                p.entry.to_stream_entry()
            })
            .collect())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.purge_expired(now);
        if inner.keys.contains_key(key) {
            return Ok(false);
        }
        inner.keys.insert(
            key.to_string(),
            Key {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        self.inner.lock().await.keys.remove(key);
        Ok(())
    }

    async fn extend_key(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.purge_expired(now);
        match inner.keys.get_mut(key) {
            Some(k) if k.value == value => {
                k.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_key_if(&self, key: &str, value: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(Instant::now());
        if inner.keys.get(key).is_some_and(|k| k.value == value) {
            inner.keys.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}
