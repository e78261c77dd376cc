//! # Capstan
//!
//! Database-backed coordination primitives for reliable, at-least-once
//! processing of side effects. All state lives in a relational database
//! (the single source of truth); workers are stateless and may be restarted
//! or scaled horizontally at any time.
//!
//! ## Primitives
//!
//! - **Outbox**: messages enqueued in the caller's transaction, dispatched
//!   asynchronously with retries ([`outbox`]).
//! - **Inbox**: deduplicated consumption of externally observed messages
//!   ([`inbox`]).
//! - **Scheduler**: one-shot timers and recurring cron jobs materialized
//!   into durable runs ([`scheduler`], [`cron`]).
//! - **Leases**: single-holder mutual exclusion with fencing tokens
//!   ([`lease`]).
//! - **Semaphores**: N concurrent holders per named resource ([`semaphore`]).
//! - **Joins**: fan-in barriers over related outbox messages ([`join`]).
//! - **External side effects**: an exactly-once envelope around
//!   non-idempotent external calls ([`effect`]).
//!
//! All message-shaped primitives share one row-level protocol
//! ([`workqueue`]): claim under a lease and an unguessable owner token,
//! then ack/abandon/fail guarded by that token. Delivery is at-least-once;
//! handlers must be idempotent per message id.
//!
//! ## Architecture
//!
//! ```text
//! Application code                Background services
//!     │ enqueue / observe /          Dispatcher ──► HandlerRegistry ──► Handler
//!     │ schedule (tx-scoped)         Reaper / RetentionSweeper
//!     ▼                              SchedulerPlanner / SemaphoreReaper
//! [ store traits ] ◄──────────────── ProviderRefresh
//!     ▼
//! relational database (capstan-postgres)
//! ```
//!
//! Storage is pluggable behind async traits; `capstan-postgres` provides
//! the production implementation, and [`testing`] ships in-memory twins for
//! tests.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use capstan::prelude::*;
//!
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.register("email.send", Arc::new(handler_fn(|msg, _ctx| async move {
//!     send_email(&msg.payload).await.map_err(HandlerFailure::transient)
//! })))?;
//!
//! let host = ServiceHost::new()
//!     .with_service(Dispatcher::new(outbox.clone(), registry.clone(), DispatcherConfig::default()))
//!     .with_service(Reaper::new(outbox.clone(), &MaintenanceConfig::default()))
//!     .with_service(RetentionSweeper::new(outbox, &MaintenanceConfig::default()));
//! host.run().await?;
//! ```

pub mod backoff;
pub mod cron;
pub mod dispatcher;
pub mod effect;
pub mod error;
pub mod handler;
pub mod inbox;
pub mod join;
pub mod lease;
pub mod maintenance;
pub mod outbox;
pub mod provider;
pub mod scheduler;
pub mod semaphore;
pub mod service;
pub mod workqueue;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod scenario_tests;

pub use backoff::BackoffPolicy;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{CoordinationError, FailureKind, HandlerFailure};
pub use handler::{handler_fn, DispatchMessage, Handler, HandlerContext, HandlerRegistry};
pub use maintenance::{MaintenanceConfig, Reaper, RetentionSweeper, SemaphoreReaper};
pub use service::{Service, ServiceHost};
pub use workqueue::{ClaimedMessage, InboxStatus, MessageQueue, MessageStatus, OwnerToken, QueueStats};

/// Convenience re-exports for application wiring.
pub mod prelude {
    pub use crate::backoff::BackoffPolicy;
    pub use crate::cron::CatchUpPolicy;
    pub use crate::dispatcher::{Dispatcher, DispatcherConfig};
    pub use crate::effect::{
        CheckOutcome, EffectConfig, EffectKey, EffectOutcome, EffectSuccess, SideEffects,
        UnknownCheckBehavior,
    };
    pub use crate::error::{CoordinationError, FailureKind, HandlerFailure};
    pub use crate::handler::{handler_fn, DispatchMessage, Handler, HandlerContext, HandlerRegistry};
    pub use crate::inbox::{InboxStore, ObserveOutcome, ObservedMessage};
    pub use crate::join::{JoinFirePolicy, JoinStore};
    pub use crate::lease::{AcquireOutcome, LeaseKeeper, LeaseStore, RenewOutcome};
    pub use crate::maintenance::{MaintenanceConfig, Reaper, RetentionSweeper, SemaphoreReaper};
    pub use crate::outbox::{EnqueueOutcome, NewOutboxMessage, OutboxStore};
    pub use crate::provider::{DiscoverySource, ProviderRefresh, StaticDiscovery, StoreProvider};
    pub use crate::scheduler::{
        CronJobStore, JobSpec, NewTimer, PlannerConfig, SchedulerPlanner, TimerStore,
    };
    pub use crate::semaphore::{
        Release, Renewal, SemaphoreConfig, SemaphoreManager, SemaphoreStore, TryAcquire,
    };
    pub use crate::service::{Service, ServiceHost};
    pub use crate::workqueue::{MessageQueue, MessageStatus, OwnerToken};
}
