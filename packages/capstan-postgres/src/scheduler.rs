//! PostgreSQL scheduler stores: one-shot timers, cron definitions, and
//! materialized job runs.
//!
//! The planner claims due definitions with `FOR UPDATE SKIP LOCKED`, so
//! multiple planner instances divide the work without double-materializing;
//! the `(job_name, scheduled_time)` unique constraint is the backstop if a
//! definition's tick is planned twice across restarts.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use capstan::cron::{self, CatchUpPolicy};
use capstan::error::{ensure_batch_size, ensure_name, CoordinationError};
use capstan::scheduler::{
    CronJobStore, JobDefinition, JobRunRecord, JobSpec, NewTimer, TimerRecord, TimerStore,
};
use capstan::workqueue::{ClaimedMessage, MessageQueue, MessageStatus, OwnerToken, QueueStats};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::interval_ms;

// =============================================================================
// Timers
// =============================================================================

/// Postgres-backed [`TimerStore`].
#[derive(Clone)]
pub struct PgTimerStore {
    pool: PgPool,
}

impl PgTimerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn record_from_row(row: &PgRow) -> Result<TimerRecord> {
        let status_code: i16 = row.get("status");
        let status = MessageStatus::from_code(status_code)
            .ok_or_else(|| anyhow!("unknown timer status code {status_code}"))?;
        let owner: Option<Uuid> = row.get("owner_token");
        Ok(TimerRecord {
            id: row.get("id"),
            topic: row.get("topic"),
            payload: row.get("payload"),
            correlation_id: row.get("correlation_id"),
            created_at: row.get("created_at"),
            due_time: row.get("due_time"),
            status,
            locked_until: row.get("locked_until"),
            owner_token: owner.map(OwnerToken::from),
            attempt_count: row.get("attempt_count"),
            last_error: row.get("last_error"),
            processed_at: row.get("processed_at"),
        })
    }
}

#[async_trait]
impl MessageQueue for PgTimerStore {
    type Id = Uuid;

    fn queue_name(&self) -> &'static str {
        "timers"
    }

    async fn claim(
        &self,
        owner: OwnerToken,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedMessage<Uuid>>> {
        ensure_batch_size(batch_size)?;

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM timers
                WHERE status = 0
                  AND due_time <= NOW()
                  AND (locked_until IS NULL OR locked_until <= NOW())
                ORDER BY due_time, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE timers
            SET status = 1,
                owner_token = $2,
                locked_until = NOW() + ($3 || ' milliseconds')::INTERVAL
            WHERE id IN (SELECT id FROM claimable)
            RETURNING id, topic, payload, correlation_id, attempt_count, due_time
            "#,
        )
        .bind(batch_size as i64)
        .bind(owner.as_uuid())
        .bind(interval_ms(lease))
        .fetch_all(&self.pool)
        .await?;

        let mut claimed: Vec<(DateTime<Utc>, ClaimedMessage<Uuid>)> = rows
            .iter()
            .map(|row| {
                let id: Uuid = row.get("id");
                let message = ClaimedMessage {
                    id,
                    topic: row.get("topic"),
                    payload: row.get("payload"),
                    dedup_id: Some(id.to_string()),
                    correlation_id: row.get("correlation_id"),
                    attempt: row.get("attempt_count"),
                };
                (row.get("due_time"), message)
            })
            .collect();
        claimed.sort_by(|a, b| (a.0, a.1.id).cmp(&(b.0, b.1.id)));
        Ok(claimed.into_iter().map(|(_, message)| message).collect())
    }

    async fn ack(&self, owner: OwnerToken, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE timers
            SET status = 2, processed_at = NOW(), owner_token = NULL, locked_until = NULL
            WHERE id = ANY($1) AND owner_token = $2 AND status = 1
            "#,
        )
        .bind(ids)
        .bind(owner.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[Uuid],
        last_error: Option<&str>,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE timers
            SET status = 0,
                attempt_count = attempt_count + 1,
                owner_token = NULL,
                locked_until = NULL,
                last_error = COALESCE($3, last_error),
                due_time = COALESCE($4, due_time)
            WHERE id = ANY($1) AND owner_token = $2 AND status = 1
            "#,
        )
        .bind(ids)
        .bind(owner.as_uuid())
        .bind(last_error)
        .bind(retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, owner: OwnerToken, ids: &[Uuid], reason: Option<&str>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE timers
            SET status = 3,
                processed_at = NOW(),
                owner_token = NULL,
                locked_until = NULL,
                last_error = COALESCE($3, last_error)
            WHERE id = ANY($1) AND owner_token = $2 AND status = 1
            "#,
        )
        .bind(ids)
        .bind(owner.as_uuid())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn extend_lease(
        &self,
        owner: OwnerToken,
        ids: &[Uuid],
        lease: Duration,
    ) -> Result<Vec<Uuid>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            UPDATE timers
            SET locked_until = NOW() + ($3 || ' milliseconds')::INTERVAL
            WHERE id = ANY($1) AND owner_token = $2 AND status = 1
            RETURNING id
            "#,
        )
        .bind(ids)
        .bind(owner.as_uuid())
        .bind(interval_ms(lease))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn reap_expired(&self, limit: usize) -> Result<u64> {
        let result = sqlx::query(
            r#"
            WITH expired AS (
                SELECT id FROM timers
                WHERE status = 1 AND locked_until <= NOW()
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE timers
            SET status = 0, owner_token = NULL, locked_until = NULL
            WHERE id IN (SELECT id FROM expired)
            "#,
        )
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>, limit: usize) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM timers
            WHERE id IN (
                SELECT id FROM timers
                WHERE status IN (2, 3) AND processed_at < $1
                LIMIT $2
            )
            "#,
        )
        .bind(older_than)
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 0) AS pending,
                COUNT(*) FILTER (WHERE status = 1) AS processing,
                COUNT(*) FILTER (WHERE status = 2) AS dispatched,
                COUNT(*) FILTER (WHERE status = 3) AS failed
            FROM timers
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueStats {
            pending: row.get("pending"),
            processing: row.get("processing"),
            dispatched: row.get("dispatched"),
            failed: row.get("failed"),
        })
    }
}

#[async_trait]
impl TimerStore for PgTimerStore {
    async fn schedule_timer(&self, timer: NewTimer) -> Result<Uuid> {
        ensure_name(&timer.topic)?;
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO timers (id, topic, payload, correlation_id, due_time)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(&timer.topic)
        .bind(&timer.payload)
        .bind(&timer.correlation_id)
        .bind(timer.due_time)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn cancel_timer(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM timers WHERE id = $1 AND status = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_timer(&self, id: Uuid) -> Result<Option<TimerRecord>> {
        let row = sqlx::query("SELECT * FROM timers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::record_from_row).transpose()
    }
}

// =============================================================================
// Cron jobs and runs
// =============================================================================

/// Postgres-backed [`CronJobStore`]. The `MessageQueue` implementation
/// claims job runs.
#[derive(Clone)]
pub struct PgCronJobStore {
    pool: PgPool,
}

impl PgCronJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn definition_from_row(row: &PgRow) -> JobDefinition {
        JobDefinition {
            name: row.get("name"),
            cron: row.get("cron"),
            topic: row.get("topic"),
            payload: row.get("payload"),
            enabled: row.get("enabled"),
            next_due: row.get("next_due"),
            last_run_at: row.get("last_run_at"),
            last_status: row.get("last_status"),
        }
    }

    fn run_from_row(row: &PgRow) -> Result<JobRunRecord> {
        let status_code: i16 = row.get("status");
        let status = MessageStatus::from_code(status_code)
            .ok_or_else(|| anyhow!("unknown job run status code {status_code}"))?;
        let owner: Option<Uuid> = row.get("owner_token");
        Ok(JobRunRecord {
            id: row.get("id"),
            job_name: row.get("job_name"),
            scheduled_time: row.get("scheduled_time"),
            topic: row.get("topic"),
            payload: row.get("payload"),
            status,
            locked_until: row.get("locked_until"),
            owner_token: owner.map(OwnerToken::from),
            attempt_count: row.get("attempt_count"),
            last_error: row.get("last_error"),
            processed_at: row.get("processed_at"),
            created_at: row.get("created_at"),
        })
    }

    /// Stamps the definition with the settlement of one of its runs.
    async fn settle_definitions(&self, run_ids: &[Uuid], status: &str) -> Result<()> {
        if run_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET last_run_at = NOW(), last_status = $2, updated_at = NOW()
            WHERE name IN (SELECT job_name FROM job_runs WHERE id = ANY($1))
            "#,
        )
        .bind(run_ids)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for PgCronJobStore {
    type Id = Uuid;

    fn queue_name(&self) -> &'static str {
        "job-runs"
    }

    async fn claim(
        &self,
        owner: OwnerToken,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedMessage<Uuid>>> {
        ensure_batch_size(batch_size)?;

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM job_runs
                WHERE status = 0
                  AND scheduled_time <= NOW()
                  AND (locked_until IS NULL OR locked_until <= NOW())
                ORDER BY scheduled_time, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job_runs
            SET status = 1,
                owner_token = $2,
                locked_until = NOW() + ($3 || ' milliseconds')::INTERVAL
            WHERE id IN (SELECT id FROM claimable)
            RETURNING id, job_name, topic, payload, attempt_count, scheduled_time
            "#,
        )
        .bind(batch_size as i64)
        .bind(owner.as_uuid())
        .bind(interval_ms(lease))
        .fetch_all(&self.pool)
        .await?;

        let mut claimed: Vec<(DateTime<Utc>, ClaimedMessage<Uuid>)> = rows
            .iter()
            .map(|row| {
                let job_name: String = row.get("job_name");
                let scheduled_time: DateTime<Utc> = row.get("scheduled_time");
                let message = ClaimedMessage {
                    id: row.get("id"),
                    topic: row.get("topic"),
                    payload: row.get("payload"),
                    dedup_id: Some(format!("{job_name}:{}", scheduled_time.timestamp())),
                    correlation_id: None,
                    attempt: row.get("attempt_count"),
                };
                (scheduled_time, message)
            })
            .collect();
        claimed.sort_by(|a, b| (a.0, a.1.id).cmp(&(b.0, b.1.id)));
        Ok(claimed.into_iter().map(|(_, message)| message).collect())
    }

    async fn ack(&self, owner: OwnerToken, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let acked: Vec<Uuid> = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = 2, processed_at = NOW(), owner_token = NULL, locked_until = NULL
            WHERE id = ANY($1) AND owner_token = $2 AND status = 1
            RETURNING id
            "#,
        )
        .bind(ids)
        .bind(owner.as_uuid())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| row.get("id"))
        .collect();
        self.settle_definitions(&acked, "succeeded").await?;
        Ok(())
    }

    async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[Uuid],
        last_error: Option<&str>,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE job_runs
            SET status = 0,
                attempt_count = attempt_count + 1,
                owner_token = NULL,
                locked_until = NULL,
                last_error = COALESCE($3, last_error),
                scheduled_time = COALESCE($4, scheduled_time)
            WHERE id = ANY($1) AND owner_token = $2 AND status = 1
            "#,
        )
        .bind(ids)
        .bind(owner.as_uuid())
        .bind(last_error)
        .bind(retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, owner: OwnerToken, ids: &[Uuid], reason: Option<&str>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let failed: Vec<Uuid> = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = 3,
                processed_at = NOW(),
                owner_token = NULL,
                locked_until = NULL,
                last_error = COALESCE($3, last_error)
            WHERE id = ANY($1) AND owner_token = $2 AND status = 1
            RETURNING id
            "#,
        )
        .bind(ids)
        .bind(owner.as_uuid())
        .bind(reason)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| row.get("id"))
        .collect();
        self.settle_definitions(&failed, "failed").await?;
        Ok(())
    }

    async fn extend_lease(
        &self,
        owner: OwnerToken,
        ids: &[Uuid],
        lease: Duration,
    ) -> Result<Vec<Uuid>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            UPDATE job_runs
            SET locked_until = NOW() + ($3 || ' milliseconds')::INTERVAL
            WHERE id = ANY($1) AND owner_token = $2 AND status = 1
            RETURNING id
            "#,
        )
        .bind(ids)
        .bind(owner.as_uuid())
        .bind(interval_ms(lease))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn reap_expired(&self, limit: usize) -> Result<u64> {
        let result = sqlx::query(
            r#"
            WITH expired AS (
                SELECT id FROM job_runs
                WHERE status = 1 AND locked_until <= NOW()
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job_runs
            SET status = 0, owner_token = NULL, locked_until = NULL
            WHERE id IN (SELECT id FROM expired)
            "#,
        )
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>, limit: usize) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_runs
            WHERE id IN (
                SELECT id FROM job_runs
                WHERE status IN (2, 3) AND processed_at < $1
                LIMIT $2
            )
            "#,
        )
        .bind(older_than)
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 0) AS pending,
                COUNT(*) FILTER (WHERE status = 1) AS processing,
                COUNT(*) FILTER (WHERE status = 2) AS dispatched,
                COUNT(*) FILTER (WHERE status = 3) AS failed
            FROM job_runs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueStats {
            pending: row.get("pending"),
            processing: row.get("processing"),
            dispatched: row.get("dispatched"),
            failed: row.get("failed"),
        })
    }
}

#[async_trait]
impl CronJobStore for PgCronJobStore {
    async fn upsert_job(&self, spec: JobSpec) -> Result<()> {
        ensure_name(&spec.name)?;
        ensure_name(&spec.topic)?;
        let schedule = cron::parse(&spec.cron)?;
        let next_due = cron::next_after(&schedule, Utc::now());

        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (name, cron, topic, payload, enabled, next_due)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO UPDATE
            SET cron = EXCLUDED.cron,
                topic = EXCLUDED.topic,
                payload = EXCLUDED.payload,
                enabled = EXCLUDED.enabled,
                next_due = EXCLUDED.next_due,
                updated_at = NOW()
            "#,
        )
        .bind(&spec.name)
        .bind(&spec.cron)
        .bind(&spec.topic)
        .bind(&spec.payload)
        .bind(spec.enabled)
        .bind(next_due)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_job_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let row = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET enabled = $2, updated_at = NOW()
            WHERE name = $1
            RETURNING cron
            "#,
        )
        .bind(name)
        .bind(enabled)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };

        // Re-enabling recomputes next_due so stale past ticks do not burst.
        if enabled {
            let cron_expr: String = row.get("cron");
            if let Ok(schedule) = cron::parse(&cron_expr) {
                sqlx::query("UPDATE scheduled_jobs SET next_due = $2 WHERE name = $1")
                    .bind(name)
                    .bind(cron::next_after(&schedule, Utc::now()))
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(true)
    }

    async fn trigger_job(&self, name: &str) -> Result<Uuid> {
        let Some(row) = sqlx::query("SELECT topic, payload FROM scheduled_jobs WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Err(CoordinationError::UnknownJob {
                name: name.to_string(),
            }
            .into());
        };

        let run_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO job_runs (id, job_name, scheduled_time, topic, payload)
            VALUES ($1, $2, NOW(), $3, $4)
            "#,
        )
        .bind(run_id)
        .bind(name)
        .bind(row.get::<String, _>("topic"))
        .bind(row.get::<serde_json::Value, _>("payload"))
        .execute(&self.pool)
        .await?;
        Ok(run_id)
    }

    async fn get_job(&self, name: &str) -> Result<Option<JobDefinition>> {
        let row = sqlx::query("SELECT * FROM scheduled_jobs WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::definition_from_row))
    }

    async fn plan_due_jobs(&self, batch: usize, policy: CatchUpPolicy) -> Result<u64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let due = sqlx::query(
            r#"
            SELECT name, cron, topic, payload, next_due
            FROM scheduled_jobs
            WHERE enabled AND next_due IS NOT NULL AND next_due <= NOW()
            ORDER BY next_due
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(batch as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut materialized = 0;
        for row in due {
            let name: String = row.get("name");
            let cron_expr: String = row.get("cron");
            let next_due: DateTime<Utc> = row.get("next_due");

            let schedule = match cron::parse(&cron_expr) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(job = %name, error = %e, "skipping job with unparseable cron");
                    continue;
                }
            };
            let step = cron::plan(&schedule, next_due, now, policy);

            if let Some(run_at) = step.run_at {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO job_runs (id, job_name, scheduled_time, topic, payload)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (job_name, scheduled_time) DO NOTHING
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(&name)
                .bind(run_at)
                .bind(row.get::<String, _>("topic"))
                .bind(row.get::<serde_json::Value, _>("payload"))
                .execute(&mut *tx)
                .await?;
                materialized += inserted.rows_affected();
            }

            sqlx::query(
                "UPDATE scheduled_jobs SET next_due = $2, updated_at = NOW() WHERE name = $1",
            )
            .bind(&name)
            .bind(step.next_due)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(materialized)
    }

    async fn list_runs(&self, name: &str) -> Result<Vec<JobRunRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM job_runs WHERE job_name = $1 ORDER BY scheduled_time, id",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::run_from_row).collect()
    }
}
