//! PostgreSQL store for external side-effect rows.
//!
//! The attempt lock is a conditional update keyed on
//! `(status, locked_until)`, so at most one worker per
//! `(operation_name, idempotency_key)` can be inside the external call at
//! a time; a crashed worker's lock simply expires.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use capstan::effect::{EffectKey, EffectRecord, EffectStatus, EffectStore, EffectSuccess};
use capstan::error::FailureKind;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::interval_ms;

/// Postgres-backed [`EffectStore`].
#[derive(Clone)]
pub struct PgEffectStore {
    pool: PgPool,
}

impl PgEffectStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn record_from_row(row: &PgRow) -> Result<EffectRecord> {
        let status_code: i16 = row.get("status");
        let status = EffectStatus::from_code(status_code)
            .ok_or_else(|| anyhow!("unknown effect status code {status_code}"))?;
        Ok(EffectRecord {
            id: row.get("id"),
            operation_name: row.get("operation_name"),
            idempotency_key: row.get("idempotency_key"),
            status,
            attempt_count: row.get("attempt_count"),
            created_at: row.get("created_at"),
            last_updated_at: row.get("last_updated_at"),
            last_attempt_at: row.get("last_attempt_at"),
            last_external_check_at: row.get("last_external_check_at"),
            locked_until: row.get("locked_until"),
            locked_by: row.get("locked_by"),
            external_reference_id: row.get("external_reference_id"),
            external_status: row.get("external_status"),
            last_error: row.get("last_error"),
            payload_hash: row.get("payload_hash"),
        })
    }
}

#[async_trait]
impl EffectStore for PgEffectStore {
    async fn get_or_create(
        &self,
        key: &EffectKey,
        payload_hash: Option<&[u8]>,
    ) -> Result<EffectRecord> {
        // Insert-if-absent, then read back whichever row won.
        sqlx::query(
            r#"
            INSERT INTO external_effects (id, operation_name, idempotency_key, payload_hash)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (operation_name, idempotency_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&key.operation_name)
        .bind(&key.idempotency_key)
        .bind(payload_hash)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM external_effects WHERE operation_name = $1 AND idempotency_key = $2",
        )
        .bind(&key.operation_name)
        .bind(&key.idempotency_key)
        .fetch_one(&self.pool)
        .await?;
        Self::record_from_row(&row)
    }

    async fn try_begin_attempt(
        &self,
        id: Uuid,
        worker: &str,
        lock_duration: Duration,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE external_effects
            SET locked_until = NOW() + ($3 || ' milliseconds')::INTERVAL,
                locked_by = $2,
                attempt_count = attempt_count + 1,
                last_attempt_at = NOW(),
                last_updated_at = NOW()
            WHERE id = $1
              AND status = 0
              AND (locked_until IS NULL OR locked_until <= NOW())
            "#,
        )
        .bind(id)
        .bind(worker)
        .bind(interval_ms(lock_duration))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_succeeded(&self, id: Uuid, success: &EffectSuccess) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE external_effects
            SET status = 1,
                external_reference_id = $2,
                external_status = $3,
                locked_until = NULL,
                locked_by = NULL,
                last_updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&success.external_reference_id)
        .bind(&success.external_status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str, kind: FailureKind) -> Result<()> {
        // Transient failures keep the row Pending with the lock released;
        // permanent ones move it to Failed.
        let status: i16 = match kind {
            FailureKind::Transient => 0,
            FailureKind::Permanent => 2,
        };
        sqlx::query(
            r#"
            UPDATE external_effects
            SET status = $2,
                last_error = $3,
                locked_until = NULL,
                locked_by = NULL,
                last_updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_check(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE external_effects
            SET last_external_check_at = NOW(), last_updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &EffectKey) -> Result<Option<EffectRecord>> {
        let row = sqlx::query(
            "SELECT * FROM external_effects WHERE operation_name = $1 AND idempotency_key = $2",
        )
        .bind(&key.operation_name)
        .bind(&key.idempotency_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::record_from_row).transpose()
    }
}
