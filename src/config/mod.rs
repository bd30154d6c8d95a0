//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The scheduler signing key is wrapped in secrecy::SecretString to prevent log leaks.

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use secrecy::SecretString;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    /// Postgres URL for the stream store. `None` runs on the in-process store.
    pub database_url: Option<SecretString>,
    pub scheduler_private_key: SecretString,
    pub scheduler_id: i64,
    pub max_workers: usize,
    /// Downstream task-submission endpoint. `None` dispatches into `tasks:ready`.
    pub task_dispatcher_url: Option<String>,
    /// chain id -> JSON-RPC URL.
    pub chain_rpc_urls: HashMap<String, String>,
    /// Performers assigned round-robin when dispatching into `tasks:ready`.
    pub performer_ids: Vec<i64>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().map(SecretString::from),
            scheduler_private_key: SecretString::from(required_var("SCHEDULER_PRIVATE_KEY")?),
            scheduler_id: parsed_var("SCHEDULER_ID", 1)?,
            max_workers: parsed_var("MAX_WORKERS", 100)?,
            task_dispatcher_url: std::env::var("TASK_DISPATCHER_URL").ok(),
            chain_rpc_urls: parse_chain_urls(
                &std::env::var("CHAIN_RPC_URLS").unwrap_or_default(),
            )?,
            performer_ids: parse_performer_ids(
                &std::env::var("PERFORMER_IDS").unwrap_or_else(|_| "1".to_string()),
            )?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("environment variable {name} is malformed: {raw}"))),
        Err(_) => Ok(default),
    }
}

/// Parse `chain_id=url,chain_id=url`.
pub fn parse_chain_urls(raw: &str) -> Result<HashMap<String, String>> {
    let mut urls = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (chain, url) = pair
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("bad CHAIN_RPC_URLS entry: {pair}")))?;
        urls.insert(chain.trim().to_string(), url.trim().to_string());
    }
    Ok(urls)
}

/// Parse a comma-separated list of performer IDs.
pub fn parse_performer_ids(raw: &str) -> Result<Vec<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse()
                .map_err(|_| Error::Config(format!("bad PERFORMER_IDS entry: {p}")))
        })
        .collect()
}

/// Tunables for the condition-based scheduler and its workers.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub scheduler_id: i64,
    pub max_workers: usize,
    pub condition_poll_interval: Duration,
    pub event_poll_interval: Duration,
    pub request_timeout: Duration,
    pub performer_lock_ttl: Duration,
    /// Triggers for the same job closer together than this are dropped.
    pub duplicate_window: Duration,
    pub stats_interval: Duration,
    pub cleanup_interval: Duration,
    pub max_block_range: u64,
    /// Transport retry for value-source fetches.
    pub fetch_retry: RetryPolicy,
    /// Transport retry for downstream task submission.
    pub dispatch_retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_id: 1,
            max_workers: 100,
            condition_poll_interval: Duration::from_secs(1),
            event_poll_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            performer_lock_ttl: Duration::from_secs(15 * 60),
            duplicate_window: Duration::from_secs(10),
            stats_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            max_block_range: 10,
            fetch_retry: RetryPolicy {
                max_retries: 3,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                backoff_factor: 2.0,
                jitter_factor: 0.2,
            },
            dispatch_retry: RetryPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scheduler_id: config.scheduler_id,
            max_workers: config.max_workers,
            ..Self::default()
        }
    }
}

/// Stream names, retention and retry constants shared with anything
/// reading the same store.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Approximate cap on entries per stream.
    pub max_len: usize,
    pub processing_ttl: Duration,
    pub completed_ttl: Duration,
    pub failed_ttl: Duration,
    pub retry_ttl: Duration,
    pub jobs_completed_ttl: Duration,
    pub max_retry_attempts: u32,
    pub retry_backoff_base: Duration,
    pub read_block: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_len: 10_000,
            processing_ttl: Duration::from_secs(60 * 60),
            completed_ttl: Duration::from_secs(60 * 60),
            failed_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            retry_ttl: Duration::from_secs(24 * 60 * 60),
            jobs_completed_ttl: Duration::from_secs(24 * 60 * 60),
            max_retry_attempts: 3,
            retry_backoff_base: Duration::from_secs(5),
            read_block: Duration::from_secs(1),
        }
    }
}
