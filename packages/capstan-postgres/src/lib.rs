//! PostgreSQL storage for the capstan coordination primitives.
//!
//! One store type per primitive, all sharing a [`sqlx::PgPool`]:
//!
//! - [`PgOutboxStore`]: outbox rows plus fan-in join bookkeeping
//! - [`PgInboxStore`]: deduplicated inbox rows
//! - [`PgTimerStore`] / [`PgCronJobStore`]: timers, cron definitions, runs
//! - [`PgLeaseStore`]: single-holder leases with fencing tokens
//! - [`PgSemaphoreStore`]: bounded semaphores
//! - [`PgEffectStore`]: external side-effect rows
//!
//! All row transitions are single atomic statements (conditional
//! `UPDATE ... RETURNING`, `INSERT ... ON CONFLICT`), claims use
//! `FOR UPDATE SKIP LOCKED`, and [`schema::migrate`] applies the embedded
//! DDL idempotently.
//!
//! # Example
//!
//! ```ignore
//! use capstan_postgres::{schema, PgOutboxStore};
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect(&database_url).await?;
//! schema::migrate(&pool).await?;
//! let outbox = PgOutboxStore::new(pool);
//! ```

pub mod effect;
pub mod inbox;
pub mod lease;
pub mod outbox;
pub mod scheduler;
pub mod schema;
pub mod semaphore;

pub use effect::PgEffectStore;
pub use inbox::PgInboxStore;
pub use lease::PgLeaseStore;
pub use outbox::PgOutboxStore;
pub use scheduler::{PgCronJobStore, PgTimerStore};
pub use semaphore::PgSemaphoreStore;

/// Renders a duration as a millisecond count for
/// `($n || ' milliseconds')::INTERVAL` binds.
pub(crate) fn interval_ms(duration: std::time::Duration) -> String {
    duration.as_millis().to_string()
}
