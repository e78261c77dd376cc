//! Embedded schema for the coordination tables.
//!
//! `migrate` applies the DDL idempotently (`CREATE TABLE IF NOT EXISTS`,
//! `CREATE INDEX IF NOT EXISTS`) and is safe to run on every startup; the
//! store provider runs it once per discovered database before any
//! dispatcher touches that store.
//!
//! Claim predicates are backed by partial indexes so `FOR UPDATE SKIP
//! LOCKED` scans stay narrow regardless of how much terminal history is
//! awaiting retention cleanup.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;

const STATEMENTS: &[&str] = &[
    // --- outbox -------------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS outbox_messages (
        id              UUID PRIMARY KEY,
        topic           TEXT NOT NULL,
        payload         JSONB NOT NULL,
        message_id      UUID NOT NULL UNIQUE,
        correlation_id  TEXT,
        created_at      TIMESTAMPTZ(3) NOT NULL DEFAULT NOW(),
        due_time        TIMESTAMPTZ(3),
        status          SMALLINT NOT NULL DEFAULT 0,
        locked_until    TIMESTAMPTZ(3),
        owner_token     UUID,
        attempt_count   INTEGER NOT NULL DEFAULT 0,
        last_error      TEXT,
        processed_at    TIMESTAMPTZ(3),
        join_id         UUID
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_claimable
        ON outbox_messages (COALESCE(due_time, created_at), id)
        WHERE status = 0
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_expired
        ON outbox_messages (locked_until)
        WHERE status = 1
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_terminal
        ON outbox_messages (processed_at)
        WHERE status IN (2, 3)
    "#,
    // --- outbox joins -------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS outbox_joins (
        join_id          UUID PRIMARY KEY,
        owner_key        TEXT NOT NULL,
        expected_steps   INTEGER NOT NULL,
        completed_steps  INTEGER NOT NULL DEFAULT 0,
        failed_steps     INTEGER NOT NULL DEFAULT 0,
        status           SMALLINT NOT NULL DEFAULT 0,
        created_at       TIMESTAMPTZ(3) NOT NULL DEFAULT NOW(),
        last_updated_at  TIMESTAMPTZ(3) NOT NULL DEFAULT NOW(),
        metadata         JSONB,
        parent_outbox_id UUID NOT NULL,
        CONSTRAINT chk_join_counters CHECK (completed_steps + failed_steps <= expected_steps)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox_join_members (
        join_id           UUID NOT NULL REFERENCES outbox_joins (join_id) ON DELETE CASCADE,
        outbox_message_id UUID NOT NULL,
        created_at        TIMESTAMPTZ(3) NOT NULL DEFAULT NOW(),
        completed_at      TIMESTAMPTZ(3),
        failed_at         TIMESTAMPTZ(3),
        PRIMARY KEY (join_id, outbox_message_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_join_members_by_message
        ON outbox_join_members (outbox_message_id)
    "#,
    // --- inbox --------------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS inbox_messages (
        message_id    VARCHAR(64) PRIMARY KEY,
        source        TEXT NOT NULL,
        hash          BYTEA,
        first_seen_at TIMESTAMPTZ(3) NOT NULL DEFAULT NOW(),
        last_seen_at  TIMESTAMPTZ(3) NOT NULL DEFAULT NOW(),
        processed_at  TIMESTAMPTZ(3),
        due_time      TIMESTAMPTZ(3),
        status        TEXT NOT NULL DEFAULT 'seen',
        attempts      INTEGER NOT NULL DEFAULT 0,
        last_error    TEXT,
        locked_until  TIMESTAMPTZ(3),
        owner_token   UUID,
        topic         TEXT,
        payload       JSONB
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_inbox_claimable
        ON inbox_messages (COALESCE(due_time, first_seen_at), message_id)
        WHERE status = 'seen' AND topic IS NOT NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_inbox_expired
        ON inbox_messages (locked_until)
        WHERE status = 'processing'
    "#,
    // --- timers -------------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS timers (
        id             UUID PRIMARY KEY,
        topic          TEXT NOT NULL,
        payload        JSONB NOT NULL,
        correlation_id TEXT,
        created_at     TIMESTAMPTZ(3) NOT NULL DEFAULT NOW(),
        due_time       TIMESTAMPTZ(3) NOT NULL,
        status         SMALLINT NOT NULL DEFAULT 0,
        locked_until   TIMESTAMPTZ(3),
        owner_token    UUID,
        attempt_count  INTEGER NOT NULL DEFAULT 0,
        last_error     TEXT,
        processed_at   TIMESTAMPTZ(3)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_timers_claimable
        ON timers (due_time, id)
        WHERE status = 0
    "#,
    // --- cron jobs and runs -------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS scheduled_jobs (
        name        TEXT PRIMARY KEY,
        cron        TEXT NOT NULL,
        topic       TEXT NOT NULL,
        payload     JSONB NOT NULL,
        enabled     BOOLEAN NOT NULL DEFAULT TRUE,
        next_due    TIMESTAMPTZ(3),
        last_run_at TIMESTAMPTZ(3),
        last_status TEXT,
        created_at  TIMESTAMPTZ(3) NOT NULL DEFAULT NOW(),
        updated_at  TIMESTAMPTZ(3) NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_runs (
        id             UUID PRIMARY KEY,
        job_name       TEXT NOT NULL REFERENCES scheduled_jobs (name) ON DELETE CASCADE,
        scheduled_time TIMESTAMPTZ(3) NOT NULL,
        topic          TEXT NOT NULL,
        payload        JSONB NOT NULL,
        status         SMALLINT NOT NULL DEFAULT 0,
        locked_until   TIMESTAMPTZ(3),
        owner_token    UUID,
        attempt_count  INTEGER NOT NULL DEFAULT 0,
        last_error     TEXT,
        processed_at   TIMESTAMPTZ(3),
        created_at     TIMESTAMPTZ(3) NOT NULL DEFAULT NOW(),
        UNIQUE (job_name, scheduled_time)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_job_runs_claimable
        ON job_runs (scheduled_time, id)
        WHERE status = 0
    "#,
    // --- leases -------------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS leases (
        resource_name TEXT PRIMARY KEY,
        owner_token   UUID,
        lease_until   TIMESTAMPTZ(3),
        fencing_token BIGINT NOT NULL DEFAULT 0,
        context       JSONB,
        updated_at    TIMESTAMPTZ(3) NOT NULL DEFAULT NOW()
    )
    "#,
    // --- semaphores ---------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS semaphores (
        name         TEXT PRIMARY KEY,
        max_holders  INTEGER NOT NULL,
        next_fencing BIGINT NOT NULL DEFAULT 1,
        updated_at   TIMESTAMPTZ(3) NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS semaphore_leases (
        name              TEXT NOT NULL REFERENCES semaphores (name) ON DELETE CASCADE,
        token             UUID NOT NULL,
        fencing           BIGINT NOT NULL,
        owner_id          TEXT NOT NULL,
        lease_until       TIMESTAMPTZ(3) NOT NULL,
        created_at        TIMESTAMPTZ(3) NOT NULL DEFAULT NOW(),
        renewed_at        TIMESTAMPTZ(3),
        client_request_id TEXT,
        PRIMARY KEY (name, token)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_semaphore_leases_expiry
        ON semaphore_leases (lease_until)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_semaphore_leases_request
        ON semaphore_leases (name, client_request_id)
        WHERE client_request_id IS NOT NULL
    "#,
    // --- external side effects ----------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS external_effects (
        id                     UUID PRIMARY KEY,
        operation_name         TEXT NOT NULL,
        idempotency_key        TEXT NOT NULL,
        status                 SMALLINT NOT NULL DEFAULT 0,
        attempt_count          INTEGER NOT NULL DEFAULT 0,
        created_at             TIMESTAMPTZ(3) NOT NULL DEFAULT NOW(),
        last_updated_at        TIMESTAMPTZ(3) NOT NULL DEFAULT NOW(),
        last_attempt_at        TIMESTAMPTZ(3),
        last_external_check_at TIMESTAMPTZ(3),
        locked_until           TIMESTAMPTZ(3),
        locked_by              TEXT,
        external_reference_id  TEXT,
        external_status        TEXT,
        last_error             TEXT,
        payload_hash           BYTEA,
        UNIQUE (operation_name, idempotency_key)
    )
    "#,
];

/// Applies the coordination schema to one database.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| {
                let head: String = statement
                    .split_whitespace()
                    .take(6)
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("schema statement failed: {head}")
            })?;
    }
    info!("coordination schema is up to date");
    Ok(())
}
