//! Durable scheduling: one-shot timers and recurring cron jobs.
//!
//! Timers are single rows that become claimable at their due time. Jobs are
//! cron definitions; a planner loop materializes one `JobRun` row per tick
//! and advances the definition's `next_due`. Both timers and job runs share
//! the work-queue protocol with their scheduled instant as the ordering
//! key, so the same dispatcher loop drives them.
//!
//! Catch-up follows [`CatchUpPolicy`]: a definition that fell behind never
//! produces a backlog; at most one run materializes at the most recent
//! missed tick (the default), or missed ticks are skipped entirely.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use crate::cron::CatchUpPolicy;
use crate::service::{idle, Service};
use crate::workqueue::{MessageQueue, MessageStatus, OwnerToken};

/// A one-shot timer to schedule.
#[derive(Debug, Clone)]
pub struct NewTimer {
    pub topic: String,
    pub payload: Value,
    pub due_time: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

impl NewTimer {
    pub fn new(topic: impl Into<String>, payload: Value, due_time: DateTime<Utc>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            due_time,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// A timer row, for inspection and tests.
#[derive(Debug, Clone)]
pub struct TimerRecord {
    pub id: Uuid,
    pub topic: String,
    pub payload: Value,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub due_time: DateTime<Utc>,
    pub status: MessageStatus,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner_token: Option<OwnerToken>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// A cron job definition to create or update.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    /// Seven-field cron expression (see [`crate::cron`]).
    pub cron: String,
    pub topic: String,
    pub payload: Value,
    pub enabled: bool,
}

impl JobSpec {
    pub fn new(
        name: impl Into<String>,
        cron: impl Into<String>,
        topic: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            name: name.into(),
            cron: cron.into(),
            topic: topic.into(),
            payload,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A stored job definition.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub name: String,
    pub cron: String,
    pub topic: String,
    pub payload: Value,
    pub enabled: bool,
    pub next_due: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Settlement status of the most recent run ("succeeded"/"failed").
    pub last_status: Option<String>,
}

/// A materialized run of a cron job.
#[derive(Debug, Clone)]
pub struct JobRunRecord {
    pub id: Uuid,
    pub job_name: String,
    /// The tick's planned instant (the claim ordering key).
    pub scheduled_time: DateTime<Utc>,
    pub topic: String,
    pub payload: Value,
    pub status: MessageStatus,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner_token: Option<OwnerToken>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Store for one-shot timers. Claims order by due time.
#[async_trait]
pub trait TimerStore: MessageQueue<Id = Uuid> {
    async fn schedule_timer(&self, timer: NewTimer) -> Result<Uuid>;

    /// Cancels a timer still in Pending state. Returns whether a row was
    /// cancelled; fired or in-flight timers are unaffected.
    async fn cancel_timer(&self, id: Uuid) -> Result<bool>;

    async fn get_timer(&self, id: Uuid) -> Result<Option<TimerRecord>>;
}

/// Store for cron definitions and their materialized runs. The
/// `MessageQueue` implementation claims job runs.
#[async_trait]
pub trait CronJobStore: MessageQueue<Id = Uuid> {
    /// Creates or updates a definition. The cron expression is validated
    /// and `next_due` recomputed from now.
    async fn upsert_job(&self, spec: JobSpec) -> Result<()>;

    /// Enables or disables a definition. Disabling stops new runs;
    /// in-flight runs complete. Returns whether the definition existed.
    async fn set_job_enabled(&self, name: &str, enabled: bool) -> Result<bool>;

    /// Materializes an immediate run regardless of the cron schedule.
    async fn trigger_job(&self, name: &str) -> Result<Uuid>;

    async fn get_job(&self, name: &str) -> Result<Option<JobDefinition>>;

    /// Materializes runs for up to `batch` due definitions, advancing each
    /// definition's `next_due` per the policy. Returns how many runs were
    /// created. Concurrent planners must not double-materialize a tick.
    async fn plan_due_jobs(&self, batch: usize, policy: CatchUpPolicy) -> Result<u64>;

    /// Runs for one job, ordered by scheduled time.
    async fn list_runs(&self, name: &str) -> Result<Vec<JobRunRecord>>;
}

/// Cadence for the planner loop.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub interval: Duration,
    pub batch: usize,
    pub catch_up: CatchUpPolicy,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch: 50,
            catch_up: CatchUpPolicy::default(),
        }
    }
}

/// Background loop turning due cron definitions into job runs.
pub struct SchedulerPlanner<S> {
    store: Arc<S>,
    config: PlannerConfig,
}

impl<S: CronJobStore + 'static> SchedulerPlanner<S> {
    pub fn new(store: Arc<S>, config: PlannerConfig) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl<S: CronJobStore + 'static> Service for SchedulerPlanner<S> {
    fn name(&self) -> &str {
        "scheduler-planner"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(interval = ?self.config.interval, "scheduler planner starting");
        while idle(&shutdown, self.config.interval).await {
            match self
                .store
                .plan_due_jobs(self.config.batch, self.config.catch_up)
                .await
            {
                Ok(0) => {}
                Ok(materialized) => {
                    debug!(materialized, "materialized job runs");
                }
                Err(e) => {
                    warn!(error = %e, "planner pass failed");
                }
            }
        }
        info!("scheduler planner stopped");
        Ok(())
    }
}
