//! Postgres-backed stream store via direct SQLx.
//!
//! Streams, groups and pending entries live in plain tables created by the
//! embedded migrations. Blocking reads poll; entry IDs are the row sequence.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{EntryId, StreamEntry, StreamStore};
use crate::error::{Error, Result};

/// How often a blocked read re-checks for new entries.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stream store handle. Owns the connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn purge_expired(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM streams WHERE expires_at IS NOT NULL AND expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Create the stream row if absent, with its remembered retention.
    async fn ensure_stream(&self, stream: &str) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO streams (name, ttl_seconds, expires_at)
             SELECT n.name, r.ttl_seconds, now() + make_interval(secs => r.ttl_seconds)
             FROM (SELECT $1::text AS name) n
             LEFT JOIN stream_retention r ON r.name = n.name
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(stream)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// One non-blocking delivery attempt.
    async fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> std::result::Result<Option<Vec<StreamEntry>>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let cursor: Option<(i64,)> = sqlx::query_as(
            "SELECT last_delivered FROM stream_groups
             WHERE stream = $1 AND group_name = $2 FOR UPDATE",
        )
        .bind(stream)
        .bind(group)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((last_delivered,)) = cursor else {
            return Ok(None);
        };

        let rows: Vec<(i64, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT seq, payload, created_at FROM stream_entries
             WHERE stream = $1 AND seq > $2 ORDER BY seq LIMIT $3",
        )
        .bind(stream)
        .bind(last_delivered)
        .bind(count as i64)
        .fetch_all(&mut *tx)
        .await?;

        if let Some((last, _, _)) = rows.last() {
            sqlx::query(
                "UPDATE stream_groups SET last_delivered = $3
                 WHERE stream = $1 AND group_name = $2",
            )
            .bind(stream)
            .bind(group)
            .bind(*last)
            .execute(&mut *tx)
            .await?;

            for (seq, _, _) in &rows {
                sqlx::query(
                    "INSERT INTO stream_pending (stream, group_name, seq, consumer)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (stream, group_name, seq)
                     DO UPDATE SET consumer = EXCLUDED.consumer, delivered_at = now()",
                )
                .bind(stream)
                .bind(group)
                .bind(*seq)
                .bind(consumer)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(Some(rows.into_iter().map(to_entry).collect()))
    }
}

fn to_entry((seq, payload, created_at): (i64, String, DateTime<Utc>)) -> StreamEntry {
    StreamEntry {
        id: seq.to_string(),
        payload,
        created_at,
    }
}

fn parse_id(id: &str) -> Result<i64> {
    id.parse()
        .map_err(|_| Error::Other(format!("malformed stream entry id: {id}")))
}

fn read_failed(stream: &str, message: impl std::fmt::Display) -> Error {
    Error::ReadFailed {
        stream: stream.to_string(),
        message: message.to_string(),
    }
}

#[async_trait]
impl StreamStore for PgStore {
    async fn create_stream(&self, stream: &str, ttl: Option<Duration>) -> Result<()> {
        let ttl_seconds = ttl.map(|t| t.as_secs_f64());
        if let Some(secs) = ttl_seconds {
            sqlx::query(
                "INSERT INTO stream_retention (name, ttl_seconds) VALUES ($1, $2)
                 ON CONFLICT (name) DO UPDATE SET ttl_seconds = EXCLUDED.ttl_seconds",
            )
            .bind(stream)
            .bind(secs)
            .execute(&self.pool)
            .await?;
        }
        sqlx::query(
            "INSERT INTO streams (name, ttl_seconds, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $2))
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(stream)
        .bind(ttl_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &str, max_len: usize) -> Result<EntryId> {
        let append_failed = |e: sqlx::Error| Error::AppendFailed {
            stream: stream.to_string(),
            message: e.to_string(),
        };
        self.purge_expired().await.map_err(append_failed)?;
        self.ensure_stream(stream).await.map_err(append_failed)?;

        let (seq,): (i64,) = sqlx::query_as(
            "INSERT INTO stream_entries (stream, payload) VALUES ($1, $2) RETURNING seq",
        )
        .bind(stream)
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .map_err(append_failed)?;

        sqlx::query(
            "UPDATE streams SET expires_at = now() + make_interval(secs => ttl_seconds)
             WHERE name = $1 AND ttl_seconds IS NOT NULL",
        )
        .bind(stream)
        .execute(&self.pool)
        .await
        .map_err(append_failed)?;

        if max_len > 0 {
            sqlx::query(
                "DELETE FROM stream_entries WHERE stream = $1 AND seq <= (
                     SELECT seq FROM stream_entries WHERE stream = $1
                     ORDER BY seq DESC OFFSET $2 LIMIT 1)",
            )
            .bind(stream)
            .bind(max_len as i64)
            .execute(&self.pool)
            .await
            .map_err(append_failed)?;
        }

        Ok(seq.to_string())
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        self.purge_expired().await?;
        self.ensure_stream(stream).await?;
        sqlx::query(
            "INSERT INTO stream_groups (stream, group_name) VALUES ($1, $2)
             ON CONFLICT (stream, group_name) DO NOTHING",
        )
        .bind(stream)
        .bind(group)
        .execute(&self.pool)
        .await?;
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
        let deadline = tokio::time::Instant::now() + block;
        self.purge_expired()
            .await
            .map_err(|e| read_failed(stream, e))?;
        loop {
            let batch = self
                .try_read(stream, group, consumer, count)
                .await
                .map_err(|e| read_failed(stream, e))?
                .ok_or_else(|| read_failed(stream, format!("no such group {group}")))?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(READ_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM stream_pending WHERE stream = $1 AND group_name = $2 AND seq = $3",
        )
        .bind(stream)
        .bind(group)
        .bind(parse_id(id)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        let (n,): (i64,) =
            sqlx::query_as("SELECT count(*) FROM stream_entries WHERE stream = $1")
                .bind(stream)
                .fetch_one(&self.pool)
                .await?;
        Ok(n as u64)
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let rows: Vec<(i64, String, DateTime<Utc>)> = sqlx::query_as(
            "WITH stale AS (
                 SELECT seq FROM stream_pending
                 WHERE stream = $1 AND group_name = $2
                   AND delivered_at <= now() - make_interval(secs => $4)
                 ORDER BY seq LIMIT $5
                 FOR UPDATE SKIP LOCKED
             ), claimed AS (
                 UPDATE stream_pending p SET consumer = $3, delivered_at = now()
                 FROM stale WHERE p.stream = $1 AND p.group_name = $2 AND p.seq = stale.seq
                 RETURNING p.seq
             )
             SELECT e.seq, e.payload, e.created_at
             FROM stream_entries e JOIN claimed c ON e.seq = c.seq
             ORDER BY e.seq",
        )
        .bind(stream)
        .bind(group)
        .bind(consumer)
        .bind(min_idle.as_secs_f64())
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| read_failed(stream, e))?;
        Ok(rows.into_iter().map(to_entry).collect())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO ttl_keys (key, value, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))
             ON CONFLICT (key) DO UPDATE
                 SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
                 WHERE ttl_keys.expires_at <= now()",
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM ttl_keys WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn extend_key(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE ttl_keys SET expires_at = now() + make_interval(secs => $3)
             WHERE key = $1 AND value = $2 AND expires_at > now()",
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_key_if(&self, key: &str, value: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM ttl_keys WHERE key = $1 AND value = $2")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
