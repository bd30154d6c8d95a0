//! Bounded retry with exponential backoff and jitter for transport calls.
//!
//! This is the transport-level retry used around stream appends, value-source
//! fetches and downstream submission. It never touches a task's
//! `retry_count`; that is the task lifecycle's business.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt. The operation runs at most `max_retries + 1` times.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Fraction of the delay randomly added or removed, in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0 for the first retry), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay before retry number `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Duration::from_secs_f64(base);
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64((base * factor).max(0.0))
    }

    /// Run `op` with the default retryability predicate, [`Error::is_retryable`].
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(cancel, Error::is_retryable, op).await
    }

    /// Run `op` until it succeeds, fails with an error `should_retry` rejects,
    /// or runs out of attempts.
    ///
    /// Cancelling `cancel` aborts immediately, including mid-backoff.
    pub async fn execute_with<T, F, Fut, P>(
        &self,
        cancel: &CancellationToken,
        should_retry: P,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = op() => result,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt = attempt + 1, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !should_retry(&err) {
                debug!(attempt = attempt + 1, error = %err, "non-retryable error");
                return Err(err);
            }

            if attempt >= self.max_retries {
                return Err(Error::RetriesExhausted {
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }

            let delay = self.delay(attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts = self.max_retries + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "operation failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
