//! PostgreSQL outbox store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent dispatchers never
//! serialize on each other; every transition is a conditional
//! `UPDATE ... WHERE (owner_token, status)` with `RETURNING`, so a stale
//! worker's ack/abandon/fail matches zero rows. Join bookkeeping rides the
//! same transaction as the ack/fail that settles a member: the member-row
//! update is the idempotence guard, the counter update is the overshoot
//! guard, and firing releases the held parent by moving its due time to
//! now.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use capstan::error::{ensure_batch_size, ensure_name, CoordinationError};
use capstan::join::{
    hold_due_time, JoinEnqueued, JoinFirePolicy, JoinMemberRecord, JoinRecord, JoinStatus,
    JoinStore,
};
use capstan::outbox::{EnqueueOutcome, NewOutboxMessage, OutboxRecord, OutboxStore};
use capstan::workqueue::{ClaimedMessage, MessageQueue, MessageStatus, OwnerToken, QueueStats};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row, Transaction};
use uuid::Uuid;

use crate::interval_ms;

/// Postgres-backed [`OutboxStore`].
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    fire_policy: JoinFirePolicy,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_fire_policy(pool, JoinFirePolicy::default())
    }

    pub fn with_fire_policy(pool: PgPool, fire_policy: JoinFirePolicy) -> Self {
        Self { pool, fire_policy }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enqueues on an existing connection so the insert can ride the
    /// caller's transaction: the message becomes visible iff the business
    /// state commits.
    pub async fn enqueue_on(
        conn: &mut PgConnection,
        message: NewOutboxMessage,
    ) -> Result<EnqueueOutcome> {
        ensure_name(&message.topic)?;
        let message_id = message.message_id.unwrap_or_else(Uuid::new_v4);
        let id = Uuid::new_v4();

        let inserted = sqlx::query(
            r#"
            INSERT INTO outbox_messages (id, topic, payload, message_id, correlation_id, due_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (message_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(&message.topic)
        .bind(&message.payload)
        .bind(message_id)
        .bind(&message.correlation_id)
        .bind(message.due_time)
        .fetch_optional(&mut *conn)
        .await?;

        if inserted.is_some() {
            return Ok(EnqueueOutcome::Created(id));
        }

        let existing = sqlx::query("SELECT id FROM outbox_messages WHERE message_id = $1")
            .bind(message_id)
            .fetch_one(&mut *conn)
            .await?;
        Ok(EnqueueOutcome::Duplicate(existing.get("id")))
    }

    fn claimed_from_row(row: &PgRow) -> ClaimedMessage<Uuid> {
        let message_id: Uuid = row.get("message_id");
        ClaimedMessage {
            id: row.get("id"),
            topic: row.get("topic"),
            payload: row.get("payload"),
            dedup_id: Some(message_id.to_string()),
            correlation_id: row.get("correlation_id"),
            attempt: row.get("attempt_count"),
        }
    }

    fn record_from_row(row: &PgRow) -> Result<OutboxRecord> {
        let status_code: i16 = row.get("status");
        let status = MessageStatus::from_code(status_code)
            .ok_or_else(|| anyhow!("unknown outbox status code {status_code}"))?;
        let owner: Option<Uuid> = row.get("owner_token");
        Ok(OutboxRecord {
            id: row.get("id"),
            topic: row.get("topic"),
            payload: row.get("payload"),
            message_id: row.get("message_id"),
            correlation_id: row.get("correlation_id"),
            created_at: row.get("created_at"),
            due_time: row.get("due_time"),
            status,
            locked_until: row.get("locked_until"),
            owner_token: owner.map(OwnerToken::from),
            attempt_count: row.get("attempt_count"),
            last_error: row.get("last_error"),
            processed_at: row.get("processed_at"),
            join_id: row.get("join_id"),
        })
    }

    /// Join bookkeeping for settled members, inside the settling
    /// transaction. The member update transitions each member at most once;
    /// the counter update is guarded against terminal joins and overshoot.
    async fn settle_members(
        &self,
        tx: &mut Transaction<'_, sqlx::Postgres>,
        settled_ids: &[Uuid],
        completed: bool,
    ) -> Result<()> {
        if settled_ids.is_empty() {
            return Ok(());
        }

        let member_update = if completed {
            r#"
            UPDATE outbox_join_members
            SET completed_at = NOW()
            WHERE outbox_message_id = ANY($1)
              AND completed_at IS NULL AND failed_at IS NULL
            RETURNING join_id
            "#
        } else {
            r#"
            UPDATE outbox_join_members
            SET failed_at = NOW()
            WHERE outbox_message_id = ANY($1)
              AND completed_at IS NULL AND failed_at IS NULL
            RETURNING join_id
            "#
        };
        let transitioned = sqlx::query(member_update)
            .bind(settled_ids)
            .fetch_all(&mut **tx)
            .await?;

        let counter_update = if completed {
            r#"
            UPDATE outbox_joins
            SET completed_steps = completed_steps + 1, last_updated_at = NOW()
            WHERE join_id = $1 AND status = 0
              AND completed_steps + failed_steps < expected_steps
            RETURNING expected_steps, completed_steps, failed_steps, parent_outbox_id
            "#
        } else {
            r#"
            UPDATE outbox_joins
            SET failed_steps = failed_steps + 1, last_updated_at = NOW()
            WHERE join_id = $1 AND status = 0
              AND completed_steps + failed_steps < expected_steps
            RETURNING expected_steps, completed_steps, failed_steps, parent_outbox_id
            "#
        };

        for member in transitioned {
            let join_id: Uuid = member.get("join_id");
            let Some(join) = sqlx::query(counter_update)
                .bind(join_id)
                .fetch_optional(&mut **tx)
                .await?
            else {
                continue;
            };

            let expected: i32 = join.get("expected_steps");
            let completed_steps: i32 = join.get("completed_steps");
            let failed_steps: i32 = join.get("failed_steps");
            let settled = completed_steps + failed_steps >= expected;
            let fire = match self.fire_policy {
                JoinFirePolicy::AllSettled => settled,
                JoinFirePolicy::EarlyOnFailure => settled || !completed,
            };
            if !fire {
                continue;
            }

            let terminal = if failed_steps == 0 {
                JoinStatus::Completed
            } else {
                JoinStatus::Failed
            };
            sqlx::query(
                r#"
                UPDATE outbox_joins
                SET status = $2, last_updated_at = NOW()
                WHERE join_id = $1 AND status = 0
                "#,
            )
            .bind(join_id)
            .bind(terminal.code())
            .execute(&mut **tx)
            .await?;

            // Release the held parent: the fan-in signal is an ordinary
            // outbox dispatch.
            let parent_id: Uuid = join.get("parent_outbox_id");
            sqlx::query(
                r#"
                UPDATE outbox_messages
                SET due_time = NOW()
                WHERE id = $1 AND status = 0
                "#,
            )
            .bind(parent_id)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for PgOutboxStore {
    type Id = Uuid;

    fn queue_name(&self) -> &'static str {
        "outbox"
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
                FROM outbox_messages
                WHERE status = 0
                  AND (due_time IS NULL OR due_time <= NOW())
                  AND (locked_until IS NULL OR locked_until <= NOW())
                ORDER BY COALESCE(due_time, created_at), id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_messages
            SET status = 1,
                owner_token = $2,
                locked_until = NOW() + ($3 || ' milliseconds')::INTERVAL
            WHERE id IN (SELECT id FROM claimable)
            RETURNING id, topic, payload, message_id, correlation_id, attempt_count,
                      COALESCE(due_time, created_at) AS order_key
            "#,
        )
        .bind(batch_size as i64)
        .bind(owner.as_uuid())
        .bind(interval_ms(lease))
        .fetch_all(&self.pool)
        .await?;

        let mut claimed: Vec<(DateTime<Utc>, ClaimedMessage<Uuid>)> = rows
            .iter()
            .map(|row| (row.get("order_key"), Self::claimed_from_row(row)))
            .collect();
        claimed.sort_by(|a, b| (a.0, a.1.id).cmp(&(b.0, b.1.id)));
        Ok(claimed.into_iter().map(|(_, message)| message).collect())
    }

    async fn ack(&self, owner: OwnerToken, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let acked: Vec<Uuid> = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 2, processed_at = NOW(), owner_token = NULL, locked_until = NULL
            WHERE id = ANY($1) AND owner_token = $2 AND status = 1
            RETURNING id
            "#,
        )
        .bind(ids)
        .bind(owner.as_uuid())
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.get("id"))
        .collect();

        self.settle_members(&mut tx, &acked, true).await?;
        tx.commit().await?;
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
            UPDATE outbox_messages
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
        let mut tx = self.pool.begin().await?;
        let failed: Vec<Uuid> = sqlx::query(
            r#"
            UPDATE outbox_messages
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
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.get("id"))
        .collect();

        self.settle_members(&mut tx, &failed, false).await?;
        tx.commit().await?;
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
            UPDATE outbox_messages
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
                SELECT id
                FROM outbox_messages
                WHERE status = 1 AND locked_until <= NOW()
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_messages
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
            DELETE FROM outbox_messages
            WHERE id IN (
                SELECT id
                FROM outbox_messages
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
            FROM outbox_messages
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
impl OutboxStore for PgOutboxStore {
    async fn enqueue(&self, message: NewOutboxMessage) -> Result<EnqueueOutcome> {
        let mut conn = self.pool.acquire().await?;
        Self::enqueue_on(&mut *conn, message).await
    }

    async fn enqueue_join(
        &self,
        parent: NewOutboxMessage,
        children: Vec<NewOutboxMessage>,
        expected_steps: u32,
    ) -> Result<JoinEnqueued> {
        if expected_steps == 0 || expected_steps as usize > children.len() {
            return Err(CoordinationError::InvalidExpectedSteps {
                expected: expected_steps,
                members: children.len(),
            }
            .into());
        }

        let join_id = Uuid::new_v4();
        let owner_key = parent
            .correlation_id
            .clone()
            .unwrap_or_else(|| parent.topic.clone());

        let mut tx = self.pool.begin().await?;

        let held_parent = NewOutboxMessage {
            due_time: Some(hold_due_time()),
            ..parent
        };
        let parent_id = match Self::enqueue_on(&mut *tx, held_parent).await? {
            EnqueueOutcome::Created(id) => id,
            EnqueueOutcome::Duplicate(_) => {
                return Err(anyhow!("join parent message_id already exists"));
            }
        };

        sqlx::query(
            r#"
            INSERT INTO outbox_joins (join_id, owner_key, expected_steps, parent_outbox_id)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(join_id)
        .bind(&owner_key)
        .bind(expected_steps as i32)
        .bind(parent_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE outbox_messages SET join_id = $2 WHERE id = $1")
            .bind(parent_id)
            .bind(join_id)
            .execute(&mut *tx)
            .await?;

        let mut child_ids = Vec::with_capacity(children.len());
        for child in children {
            let child_id = match Self::enqueue_on(&mut *tx, child).await? {
                EnqueueOutcome::Created(id) => id,
                EnqueueOutcome::Duplicate(_) => {
                    return Err(anyhow!("join member message_id already exists"));
                }
            };
            sqlx::query("UPDATE outbox_messages SET join_id = $2 WHERE id = $1")
                .bind(child_id)
                .bind(join_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                r#"
                INSERT INTO outbox_join_members (join_id, outbox_message_id)
                VALUES ($1, $2)
                "#,
            )
            .bind(join_id)
            .bind(child_id)
            .execute(&mut *tx)
            .await?;
            child_ids.push(child_id);
        }

        tx.commit().await?;
        Ok(JoinEnqueued {
            parent_id,
            join_id,
            child_ids,
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxRecord>> {
        let row = sqlx::query("SELECT * FROM outbox_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::record_from_row).transpose()
    }
}

#[async_trait]
impl JoinStore for PgOutboxStore {
    async fn get_join(&self, join_id: Uuid) -> Result<Option<JoinRecord>> {
        let Some(row) = sqlx::query("SELECT * FROM outbox_joins WHERE join_id = $1")
            .bind(join_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let status_code: i16 = row.get("status");
        let status = JoinStatus::from_code(status_code)
            .ok_or_else(|| anyhow!("unknown join status code {status_code}"))?;
        Ok(Some(JoinRecord {
            join_id: row.get("join_id"),
            owner_key: row.get("owner_key"),
            expected_steps: row.get::<i32, _>("expected_steps") as u32,
            completed_steps: row.get::<i32, _>("completed_steps") as u32,
            failed_steps: row.get::<i32, _>("failed_steps") as u32,
            status,
            created_at: row.get("created_at"),
            last_updated_at: row.get("last_updated_at"),
            metadata: row.get("metadata"),
            parent_outbox_id: row.get("parent_outbox_id"),
        }))
    }

    async fn join_members(&self, join_id: Uuid) -> Result<Vec<JoinMemberRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT join_id, outbox_message_id, created_at, completed_at, failed_at
            FROM outbox_join_members
            WHERE join_id = $1
            ORDER BY created_at, outbox_message_id
            "#,
        )
        .bind(join_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| JoinMemberRecord {
                join_id: row.get("join_id"),
                outbox_message_id: row.get("outbox_message_id"),
                created_at: row.get("created_at"),
                completed_at: row.get("completed_at"),
                failed_at: row.get("failed_at"),
            })
            .collect())
    }
}
