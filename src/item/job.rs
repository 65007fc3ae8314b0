use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::ItemStatus;
use super::work_item::WorkItem;
use crate::error::JobError;
use crate::health::HealthSnapshot;
use crate::rate_limit::RateLimit;

/// Retry behavior for transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total tries per item, including the first one.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    pub multiplier: f64,
    /// Upper bound on a single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows attempt number `attempt`.
    /// delay = base_delay_ms * multiplier^(attempt - 1), capped at max_delay_ms
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// How items are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Bounded worker pool of `concurrency` in-flight items.
    #[default]
    Parallel,
    /// One item at a time, in input order.
    Sequential,
}

/// Settings for one job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Key for the rate limiter and health monitor (usually the endpoint URL).
    pub destination: String,
    pub concurrency: usize,
    pub mode: ExecutionMode,
    pub retry: RetryPolicy,
    /// When false, dispatch stops after the first Failed item.
    pub continue_on_error: bool,
    pub rate_limit: Option<RateLimit>,
    pub deduplicate: bool,
    /// Flush the checkpoint every N terminal items. 0 disables checkpointing.
    pub checkpoint_interval_items: usize,
    /// Deadline for a single attempt of the work function.
    pub item_timeout: Duration,
    /// How long in-flight items may keep running after cancellation.
    pub cancel_grace: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            destination: "default".to_string(),
            concurrency: 4,
            mode: ExecutionMode::Parallel,
            retry: RetryPolicy::default(),
            continue_on_error: true,
            rate_limit: None,
            deduplicate: false,
            checkpoint_interval_items: 10,
            item_timeout: Duration::from_secs(60),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

impl JobConfig {
    /// Reject settings the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.concurrency == 0 {
            return Err(JobError::InvalidConfig(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(JobError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(JobError::InvalidConfig(format!(
                "backoff multiplier must be a finite number >= 1, got {}",
                self.retry.multiplier
            )));
        }
        if let Some(limit) = &self.rate_limit {
            limit.validate()?;
        }
        if self.item_timeout.is_zero() {
            return Err(JobError::InvalidConfig("item_timeout must be positive".into()));
        }
        Ok(())
    }

    /// Effective number of simultaneous in-flight items.
    pub fn effective_concurrency(&self) -> usize {
        match self.mode {
            ExecutionMode::Parallel => self.concurrency,
            ExecutionMode::Sequential => 1,
        }
    }
}

/// Aggregate outcome of a job run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub destination: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Items restored from the checkpoint instead of being dispatched.
    pub resumed: usize,
    pub items: Vec<WorkItem>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Dispatch stopped early because an item failed and `continue_on_error` is off.
    pub aborted: bool,
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_health: Option<HealthSnapshot>,
}

impl JobResult {
    /// Aggregate terminal items into a result. Counts are derived from `items`
    /// so they always add up to `total`.
    pub fn from_items(
        job_id: Uuid,
        destination: String,
        items: Vec<WorkItem>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let count = |status: ItemStatus| items.iter().filter(|i| i.status == status).count();
        let succeeded = count(ItemStatus::Success);
        let failed = count(ItemStatus::Failed);
        let skipped = count(ItemStatus::Skipped);
        let resumed = items.iter().filter(|i| i.resumed).count();

        Self {
            job_id,
            destination,
            total: items.len(),
            succeeded,
            failed,
            skipped,
            resumed,
            items,
            started_at,
            finished_at: Utc::now(),
            aborted: false,
            cancelled: false,
            destination_health: None,
        }
    }

    pub fn successes(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter().filter(|i| i.status == ItemStatus::Success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter().filter(|i| i.status == ItemStatus::Failed)
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// True when every item ended Success.
    pub fn is_clean(&self) -> bool {
        self.succeeded == self.total
    }
}
