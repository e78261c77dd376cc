//! PostgreSQL semaphore store.
//!
//! `try_acquire` runs in one transaction that locks the definition row
//! (`FOR UPDATE`), so the count-then-insert cannot race another acquirer
//! past the holder limit. Expired leases are deleted opportunistically (a
//! handful per acquire) and in bulk by the background reaper.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use capstan::error::ensure_name;
use capstan::semaphore::{
    ReleaseOutcome, RenewalOutcome, SemaphoreLease, SemaphoreStore, TryAcquireOutcome,
};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::interval_ms;

/// Expired leases deleted per acquire, amortizing cleanup across callers.
const REAP_PER_ACQUIRE: i64 = 5;

/// Postgres-backed [`SemaphoreStore`].
#[derive(Clone)]
pub struct PgSemaphoreStore {
    pool: PgPool,
}

impl PgSemaphoreStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SemaphoreStore for PgSemaphoreStore {
    async fn register(&self, name: &str, limit: u32) -> Result<()> {
        ensure_name(name)?;
        sqlx::query(
            r#"
            INSERT INTO semaphores (name, max_holders)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE
            SET max_holders = EXCLUDED.max_holders, updated_at = NOW()
            "#,
        )
        .bind(name)
        .bind(limit as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_acquire(
        &self,
        name: &str,
        ttl: Duration,
        owner_id: &str,
        client_request_id: Option<&str>,
    ) -> Result<TryAcquireOutcome> {
        let mut tx = self.pool.begin().await?;

        // Lock the definition row; all competing acquires serialize here.
        let Some(definition) =
            sqlx::query("SELECT max_holders FROM semaphores WHERE name = $1 FOR UPDATE")
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?
        else {
            return Ok(TryAcquireOutcome::NotAcquired);
        };
        let limit: i32 = definition.get("max_holders");

        // Idempotent retry: hand back the live lease for this request id.
        if let Some(request_id) = client_request_id {
            let existing = sqlx::query(
                r#"
                SELECT token, fencing, lease_until
                FROM semaphore_leases
                WHERE name = $1 AND client_request_id = $2 AND lease_until > NOW()
                "#,
            )
            .bind(name)
            .bind(request_id)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = existing {
                tx.commit().await?;
                return Ok(TryAcquireOutcome::Acquired(SemaphoreLease {
                    name: name.to_string(),
                    token: row.get("token"),
                    fencing_token: row.get("fencing"),
                    expires_at: row.get("lease_until"),
                }));
            }
        }

        // Amortized reaping of a few expired leases.
        sqlx::query(
            r#"
            DELETE FROM semaphore_leases
            WHERE name = $1 AND token IN (
                SELECT token FROM semaphore_leases
                WHERE name = $1 AND lease_until <= NOW()
                LIMIT $2
            )
            "#,
        )
        .bind(name)
        .bind(REAP_PER_ACQUIRE)
        .execute(&mut *tx)
        .await?;

        let live: i64 = sqlx::query(
            "SELECT COUNT(*) AS live FROM semaphore_leases WHERE name = $1 AND lease_until > NOW()",
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await?
        .get("live");
        if live >= limit as i64 {
            return Ok(TryAcquireOutcome::NotAcquired);
        }

        let fencing: i64 = sqlx::query(
            r#"
            UPDATE semaphores
            SET next_fencing = next_fencing + 1, updated_at = NOW()
            WHERE name = $1
            RETURNING next_fencing - 1 AS fencing
            "#,
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await?
        .get("fencing");

        let token = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            INSERT INTO semaphore_leases (name, token, fencing, owner_id, lease_until, client_request_id)
            VALUES ($1, $2, $3, $4, NOW() + ($5 || ' milliseconds')::INTERVAL, $6)
            RETURNING lease_until
            "#,
        )
        .bind(name)
        .bind(token)
        .bind(fencing)
        .bind(owner_id)
        .bind(interval_ms(ttl))
        .bind(client_request_id)
        .fetch_one(&mut *tx)
        .await?;
        let expires_at = row.get("lease_until");

        tx.commit().await?;
        Ok(TryAcquireOutcome::Acquired(SemaphoreLease {
            name: name.to_string(),
            token,
            fencing_token: fencing,
            expires_at,
        }))
    }

    async fn renew(&self, name: &str, token: Uuid, ttl: Duration) -> Result<RenewalOutcome> {
        let row = sqlx::query(
            r#"
            UPDATE semaphore_leases
            SET lease_until = NOW() + ($3 || ' milliseconds')::INTERVAL,
                renewed_at = NOW()
            WHERE name = $1 AND token = $2 AND lease_until > NOW()
            RETURNING lease_until
            "#,
        )
        .bind(name)
        .bind(token)
        .bind(interval_ms(ttl))
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => RenewalOutcome::Renewed {
                expires_at: row.get("lease_until"),
            },
            None => RenewalOutcome::Lost,
        })
    }

    async fn release(&self, name: &str, token: Uuid) -> Result<ReleaseOutcome> {
        let result = sqlx::query("DELETE FROM semaphore_leases WHERE name = $1 AND token = $2")
            .bind(name)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(if result.rows_affected() > 0 {
            ReleaseOutcome::Released
        } else {
            ReleaseOutcome::NotFound
        })
    }

    async fn reap_expired(&self, name: Option<&str>, max_rows: usize) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM semaphore_leases
            WHERE (name, token) IN (
                SELECT name, token FROM semaphore_leases
                WHERE lease_until <= NOW() AND ($1::TEXT IS NULL OR name = $1)
                LIMIT $2
            )
            "#,
        )
        .bind(name)
        .bind(max_rows as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn live_count(&self, name: &str) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS live FROM semaphore_leases WHERE name = $1 AND lease_until > NOW()",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("live") as u64)
    }
}
