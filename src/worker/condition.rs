//! Condition worker: poll a value source and compare against limits.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::debug;

use super::{Monitor, PollOutcome, TriggerNotification, WorkerContext, record_check};
use crate::error::Result;
use crate::model::{ConditionSpec, ConditionType, SourceType, TriggerDetail};
use crate::worker::value::ValueFetcher;

pub struct ConditionMonitor {
    spec: ConditionSpec,
    condition: ConditionType,
    source: SourceType,
    fetcher: ValueFetcher,
    interval: Interval,
}

impl ConditionMonitor {
    /// Fails on an unsupported condition or source type.
    pub fn new(spec: ConditionSpec, fetcher: ValueFetcher, poll_interval: Duration) -> Result<Self> {
        let condition = spec.condition_type()?;
        let source = spec.source_type()?;
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ok(Self {
            spec,
            condition,
            source,
            fetcher,
            interval,
        })
    }

    async fn current_value(&self, ctx: &WorkerContext) -> Result<f64> {
        match self.source {
            SourceType::Static => self.spec.static_value(),
            SourceType::Api | SourceType::Oracle => {
                self.fetcher
                    .fetch(
                        &self.spec.value_source_url,
                        self.spec.selected_key_route.as_deref(),
                        &ctx.cancel,
                    )
                    .await
            }
        }
    }
}

#[async_trait]
impl Monitor for ConditionMonitor {
    fn source(&self) -> &'static str {
        self.source.as_str()
    }

    async fn wait(&mut self, _ctx: &WorkerContext) -> Result<()> {
        self.interval.tick().await;
        Ok(())
    }

    async fn check(&mut self, ctx: &WorkerContext) -> Result<PollOutcome> {
        let value = self.current_value(ctx).await?;
        let now = Utc::now();
        {
            let mut state = ctx.state.write().await;
            state.last_value = Some(value);
            state.last_check = Some(now);
        }

        let satisfied =
            self.condition
                .is_satisfied(value, self.spec.lower_limit, self.spec.upper_limit);
        record_check(self.source.as_str(), satisfied);

        if !satisfied {
            debug!(
                job_id = %ctx.job.job_id,
                value,
                condition = %self.condition,
                "condition not satisfied"
            );
            ctx.record_unsatisfied().await;
            return Ok(PollOutcome::Continue);
        }

        debug!(job_id = %ctx.job.job_id, value, condition = %self.condition, "condition satisfied");
        Ok(ctx
            .fire(TriggerNotification {
                job_id: ctx.job.job_id,
                triggered_at: now,
                detail: TriggerDetail::Condition {
                    satisfied_value: value,
                    condition_type: self.condition.as_str().to_string(),
                    value_source: self.source.as_str().to_string(),
                    lower_limit: self.spec.lower_limit,
                    upper_limit: self.spec.upper_limit,
                },
            })
            .await)
    }
}
