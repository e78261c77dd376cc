//! PostgreSQL lease store.
//!
//! Acquisition is one `INSERT ... ON CONFLICT DO UPDATE` whose conditional
//! `WHERE` encodes the takeover rule (free, expired, or re-entrant) and
//! whose `RETURNING` proves success; the fencing counter only ever
//! increments inside that statement, so monotonicity is enforced by the
//! row itself. The optional gate is a transaction-scoped advisory lock
//! bounded by `lock_timeout`; timing out falls back to the ungated path
//! because the gate is an optimization, not a correctness requirement.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use capstan::error::ensure_name;
use capstan::lease::{AcquireOutcome, LeaseConfig, LeaseRecord, LeaseStore, RenewOutcome};
use capstan::workqueue::OwnerToken;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::interval_ms;

const ACQUIRE_SQL: &str = r#"
    INSERT INTO leases (resource_name, owner_token, lease_until, fencing_token, context, updated_at)
    VALUES ($1, $2, NOW() + ($3 || ' milliseconds')::INTERVAL, 1, $4, NOW())
    ON CONFLICT (resource_name) DO UPDATE
    SET owner_token = EXCLUDED.owner_token,
        lease_until = EXCLUDED.lease_until,
        fencing_token = leases.fencing_token + 1,
        context = COALESCE(EXCLUDED.context, leases.context),
        updated_at = NOW()
    WHERE leases.owner_token IS NULL
       OR leases.lease_until IS NULL
       OR leases.lease_until <= NOW()
       OR leases.owner_token = EXCLUDED.owner_token
    RETURNING fencing_token
"#;

/// Postgres-backed [`LeaseStore`].
#[derive(Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
    config: LeaseConfig,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, LeaseConfig::default())
    }

    pub fn with_config(pool: PgPool, config: LeaseConfig) -> Self {
        Self { pool, config }
    }

    /// Acquire under the advisory gate. Holding the gate for the duration
    /// of the statement serializes stampedes on one hot resource name; a
    /// gate timeout aborts the transaction and the caller retries ungated.
    async fn acquire_gated(
        &self,
        name: &str,
        owner: OwnerToken,
        ttl: Duration,
        context: &Option<Value>,
    ) -> Result<Option<Option<i64>>> {
        let mut tx = self.pool.begin().await?;

        let timeout_ms = self.config.gate_timeout.as_millis().max(1);
        // lock_timeout does not accept bind parameters; the value is a
        // sanitized integer from our own config.
        sqlx::query(&format!("SET LOCAL lock_timeout = '{timeout_ms}ms'"))
            .execute(&mut *tx)
            .await?;

        let gate = sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(name)
            .execute(&mut *tx)
            .await;
        if gate.is_err() {
            // Gate timed out; the transaction is poisoned. Signal fallback.
            debug!(resource = %name, "advisory gate timed out, falling back to ungated acquire");
            return Ok(None);
        }

        let fencing = sqlx::query(ACQUIRE_SQL)
            .bind(name)
            .bind(owner.as_uuid())
            .bind(interval_ms(ttl))
            .bind(context)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.get::<i64, _>("fencing_token"));
        tx.commit().await?;
        Ok(Some(fencing))
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn acquire(
        &self,
        name: &str,
        owner: OwnerToken,
        ttl: Duration,
        context: Option<Value>,
    ) -> Result<AcquireOutcome> {
        ensure_name(name)?;

        if self.config.use_gate {
            if let Some(fencing) = self.acquire_gated(name, owner, ttl, &context).await? {
                return Ok(match fencing {
                    Some(fencing_token) => AcquireOutcome::Acquired { fencing_token },
                    None => AcquireOutcome::Held,
                });
            }
        }

        let fencing = sqlx::query(ACQUIRE_SQL)
            .bind(name)
            .bind(owner.as_uuid())
            .bind(interval_ms(ttl))
            .bind(&context)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.get::<i64, _>("fencing_token"));
        Ok(match fencing {
            Some(fencing_token) => AcquireOutcome::Acquired { fencing_token },
            None => AcquireOutcome::Held,
        })
    }

    async fn renew(&self, name: &str, owner: OwnerToken, ttl: Duration) -> Result<RenewOutcome> {
        let row = sqlx::query(
            r#"
            UPDATE leases
            SET lease_until = NOW() + ($3 || ' milliseconds')::INTERVAL,
                fencing_token = fencing_token + 1,
                updated_at = NOW()
            WHERE resource_name = $1 AND owner_token = $2
            RETURNING fencing_token
            "#,
        )
        .bind(name)
        .bind(owner.as_uuid())
        .bind(interval_ms(ttl))
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => RenewOutcome::Renewed {
                fencing_token: row.get("fencing_token"),
            },
            None => RenewOutcome::Lost,
        })
    }

    async fn release(&self, name: &str, owner: OwnerToken) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE leases
            SET owner_token = NULL, lease_until = NULL, updated_at = NOW()
            WHERE resource_name = $1 AND owner_token = $2
            "#,
        )
        .bind(name)
        .bind(owner.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, name: &str) -> Result<Option<LeaseRecord>> {
        let row = sqlx::query(
            "SELECT resource_name, owner_token, lease_until, fencing_token, context FROM leases WHERE resource_name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| {
            let owner: Option<Uuid> = row.get("owner_token");
            LeaseRecord {
                resource_name: row.get("resource_name"),
                owner_token: owner.map(OwnerToken::from),
                lease_until: row.get("lease_until"),
                fencing_token: row.get("fencing_token"),
                context: row.get("context"),
            }
        }))
    }
}
