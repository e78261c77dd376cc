//! PostgreSQL inbox store.
//!
//! `observe` is a single `INSERT ... ON CONFLICT DO UPDATE` so concurrent
//! sightings of one message id race safely: exactly one row exists, later
//! sightings only move `last_seen_at`. Rows without a topic are dedup
//! records and are excluded from claims.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use capstan::error::ensure_batch_size;
use capstan::inbox::{ensure_message_id, InboxRecord, InboxStore, ObserveOutcome, ObservedMessage};
use capstan::workqueue::{ClaimedMessage, InboxStatus, MessageQueue, OwnerToken, QueueStats};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::interval_ms;

/// Postgres-backed [`InboxStore`].
#[derive(Clone)]
pub struct PgInboxStore {
    pool: PgPool,
}

impl PgInboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn record_from_row(row: &PgRow) -> Result<InboxRecord> {
        let status_text: String = row.get("status");
        let status = InboxStatus::from_str(&status_text)
            .ok_or_else(|| anyhow!("unknown inbox status `{status_text}`"))?;
        let owner: Option<Uuid> = row.get("owner_token");
        Ok(InboxRecord {
            message_id: row.get("message_id"),
            source: row.get("source"),
            hash: row.get("hash"),
            first_seen_at: row.get("first_seen_at"),
            last_seen_at: row.get("last_seen_at"),
            processed_at: row.get("processed_at"),
            due_time: row.get("due_time"),
            status,
            attempts: row.get("attempts"),
            last_error: row.get("last_error"),
            locked_until: row.get("locked_until"),
            owner_token: owner.map(OwnerToken::from),
            topic: row.get("topic"),
            payload: row.get("payload"),
        })
    }
}

#[async_trait]
impl MessageQueue for PgInboxStore {
    type Id = String;

    fn queue_name(&self) -> &'static str {
        "inbox"
    }

    async fn claim(
        &self,
        owner: OwnerToken,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedMessage<String>>> {
        ensure_batch_size(batch_size)?;

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT message_id
                FROM inbox_messages
                WHERE status = 'seen'
                  AND topic IS NOT NULL
                  AND (due_time IS NULL OR due_time <= NOW())
                  AND (locked_until IS NULL OR locked_until <= NOW())
                ORDER BY COALESCE(due_time, first_seen_at), message_id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE inbox_messages
            SET status = 'processing',
                owner_token = $2,
                locked_until = NOW() + ($3 || ' milliseconds')::INTERVAL
            WHERE message_id IN (SELECT message_id FROM claimable)
            RETURNING message_id, topic, payload, attempts,
                      COALESCE(due_time, first_seen_at) AS order_key
            "#,
        )
        .bind(batch_size as i64)
        .bind(owner.as_uuid())
        .bind(interval_ms(lease))
        .fetch_all(&self.pool)
        .await?;

        let mut claimed: Vec<(DateTime<Utc>, ClaimedMessage<String>)> = rows
            .iter()
            .map(|row| {
                let message_id: String = row.get("message_id");
                let message = ClaimedMessage {
                    id: message_id.clone(),
                    topic: row.get::<Option<String>, _>("topic").unwrap_or_default(),
                    payload: row
                        .get::<Option<serde_json::Value>, _>("payload")
                        .unwrap_or(serde_json::Value::Null),
                    dedup_id: Some(message_id),
                    correlation_id: None,
                    attempt: row.get("attempts"),
                };
                (row.get("order_key"), message)
            })
            .collect();
        claimed.sort_by(|a, b| (&a.0, &a.1.id).cmp(&(&b.0, &b.1.id)));
        Ok(claimed.into_iter().map(|(_, message)| message).collect())
    }

    async fn ack(&self, owner: OwnerToken, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE inbox_messages
            SET status = 'done', processed_at = NOW(), owner_token = NULL, locked_until = NULL
            WHERE message_id = ANY($1) AND owner_token = $2 AND status = 'processing'
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
        ids: &[String],
        last_error: Option<&str>,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE inbox_messages
            SET status = 'seen',
                attempts = attempts + 1,
                owner_token = NULL,
                locked_until = NULL,
                last_error = COALESCE($3, last_error),
                due_time = COALESCE($4, due_time)
            WHERE message_id = ANY($1) AND owner_token = $2 AND status = 'processing'
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

    async fn fail(&self, owner: OwnerToken, ids: &[String], reason: Option<&str>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE inbox_messages
            SET status = 'dead',
                processed_at = NOW(),
                owner_token = NULL,
                locked_until = NULL,
                last_error = COALESCE($3, last_error)
            WHERE message_id = ANY($1) AND owner_token = $2 AND status = 'processing'
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
        ids: &[String],
        lease: Duration,
    ) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            UPDATE inbox_messages
            SET locked_until = NOW() + ($3 || ' milliseconds')::INTERVAL
            WHERE message_id = ANY($1) AND owner_token = $2 AND status = 'processing'
            RETURNING message_id
            "#,
        )
        .bind(ids)
        .bind(owner.as_uuid())
        .bind(interval_ms(lease))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("message_id")).collect())
    }

    async fn reap_expired(&self, limit: usize) -> Result<u64> {
        let result = sqlx::query(
            r#"
            WITH expired AS (
                SELECT message_id
                FROM inbox_messages
                WHERE status = 'processing' AND locked_until <= NOW()
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE inbox_messages
            SET status = 'seen', owner_token = NULL, locked_until = NULL
            WHERE message_id IN (SELECT message_id FROM expired)
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
            DELETE FROM inbox_messages
            WHERE message_id IN (
                SELECT message_id
                FROM inbox_messages
                WHERE status IN ('done', 'dead') AND processed_at < $1
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
                COUNT(*) FILTER (WHERE status = 'seen') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'done') AS dispatched,
                COUNT(*) FILTER (WHERE status = 'dead') AS failed
            FROM inbox_messages
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
impl InboxStore for PgInboxStore {
    async fn observe(&self, message: ObservedMessage) -> Result<ObserveOutcome> {
        ensure_message_id(&message.message_id)?;

        // `xmax = 0` distinguishes a fresh insert from a conflict update.
        let row = sqlx::query(
            r#"
            INSERT INTO inbox_messages (message_id, source, topic, payload, hash, due_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (message_id) DO UPDATE SET last_seen_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&message.message_id)
        .bind(&message.source)
        .bind(&message.topic)
        .bind(&message.payload)
        .bind(&message.hash)
        .bind(message.due_time)
        .fetch_one(&self.pool)
        .await?;

        if row.get::<bool, _>("inserted") {
            Ok(ObserveOutcome::Accepted)
        } else {
            Ok(ObserveOutcome::Duplicate)
        }
    }

    async fn get(&self, message_id: &str) -> Result<Option<InboxRecord>> {
        let row = sqlx::query("SELECT * FROM inbox_messages WHERE message_id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::record_from_row).transpose()
    }
}
