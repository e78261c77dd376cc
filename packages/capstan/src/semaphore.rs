//! Bounded semaphores: N concurrent lease holders per named resource.
//!
//! A semaphore is declared once (name → holder limit); acquisition inserts
//! a lease row when the live-holder count is under the limit. Each lease
//! carries its own fencing token allocated from the semaphore's counter,
//! and an optional client request id makes acquisition idempotent across
//! retries of the same logical request. Expired leases are reaped
//! opportunistically on acquire and in bulk by a background loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::error;
use uuid::Uuid;

use crate::error::{ensure_name, CoordinationError};

/// Limits applied by the manager before touching storage.
#[derive(Debug, Clone)]
pub struct SemaphoreConfig {
    /// TTLs below this are raised to it.
    pub min_ttl: Duration,
    /// TTLs above this are lowered to it.
    pub max_ttl: Duration,
    /// Holder limits above this are rejected at registration.
    pub max_limit: u32,
    /// Expired leases deleted opportunistically per acquire.
    pub reap_per_acquire: usize,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            min_ttl: Duration::from_secs(1),
            max_ttl: Duration::from_secs(900),
            max_limit: 1024,
            reap_per_acquire: 5,
        }
    }
}

/// A held semaphore lease.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SemaphoreLease {
    pub name: String,
    pub token: Uuid,
    pub fencing_token: i64,
    pub expires_at: DateTime<Utc>,
}

/// Store-level acquire outcome. Storage errors stay on the `Err` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryAcquireOutcome {
    Acquired(SemaphoreLease),
    /// No capacity, or no semaphore is registered under the name.
    NotAcquired,
}

/// Store-level renew outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    Renewed { expires_at: DateTime<Utc> },
    /// The lease expired or was released.
    Lost,
}

/// Store-level release outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotFound,
}

/// Public acquire result: the store outcome plus an `Unavailable` arm the
/// manager substitutes for storage failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryAcquire {
    Acquired(SemaphoreLease),
    NotAcquired,
    Unavailable,
}

/// Public renew result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Renewal {
    Renewed { expires_at: DateTime<Utc> },
    Lost,
    Unavailable,
}

/// Public release result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Released,
    NotFound,
    Unavailable,
}

/// Storage for bounded semaphores.
#[async_trait]
pub trait SemaphoreStore: Send + Sync {
    /// Declares (or re-limits) a semaphore.
    async fn register(&self, name: &str, limit: u32) -> Result<()>;

    /// Attempts to take one slot. `client_request_id` makes retries of the
    /// same logical request return the existing live lease instead of a
    /// second slot.
    async fn try_acquire(
        &self,
        name: &str,
        ttl: Duration,
        owner_id: &str,
        client_request_id: Option<&str>,
    ) -> Result<TryAcquireOutcome>;

    /// Extends a live lease.
    async fn renew(&self, name: &str, token: Uuid, ttl: Duration) -> Result<RenewalOutcome>;

    /// Deletes a lease.
    async fn release(&self, name: &str, token: Uuid) -> Result<ReleaseOutcome>;

    /// Bulk-deletes expired leases, optionally scoped to one semaphore.
    /// Returns the number deleted.
    async fn reap_expired(&self, name: Option<&str>, max_rows: usize) -> Result<u64>;

    /// Live (unexpired) lease count for a semaphore.
    async fn live_count(&self, name: &str) -> Result<u64>;
}

/// Validating front over a [`SemaphoreStore`] that clamps TTLs and maps
/// storage failures to the `Unavailable` arms of the public result types.
pub struct SemaphoreManager<S> {
    store: Arc<S>,
    config: SemaphoreConfig,
}

impl<S: SemaphoreStore> SemaphoreManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            config: SemaphoreConfig::default(),
        }
    }

    pub fn with_config(store: Arc<S>, config: SemaphoreConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn clamp_ttl(&self, ttl: Duration) -> Duration {
        ttl.clamp(self.config.min_ttl, self.config.max_ttl)
    }

    /// Declares a semaphore. Rejects empty names, zero limits, and limits
    /// above the configured maximum.
    pub async fn register(&self, name: &str, limit: u32) -> Result<(), CoordinationError> {
        ensure_name(name)?;
        if limit == 0 || limit > self.config.max_limit {
            return Err(CoordinationError::InvalidConfig {
                message: format!("limit {} must be in 1..={}", limit, self.config.max_limit),
            });
        }
        self.store
            .register(name, limit)
            .await
            .map_err(|e| CoordinationError::InvalidConfig {
                message: format!("failed to register semaphore `{name}`: {e}"),
            })
    }

    pub async fn try_acquire(
        &self,
        name: &str,
        ttl: Duration,
        owner_id: &str,
        client_request_id: Option<&str>,
    ) -> TryAcquire {
        if ensure_name(name).is_err() {
            return TryAcquire::NotAcquired;
        }
        let ttl = self.clamp_ttl(ttl);
        match self
            .store
            .try_acquire(name, ttl, owner_id, client_request_id)
            .await
        {
            Ok(TryAcquireOutcome::Acquired(lease)) => TryAcquire::Acquired(lease),
            Ok(TryAcquireOutcome::NotAcquired) => TryAcquire::NotAcquired,
            Err(e) => {
                error!(semaphore = %name, error = %e, "semaphore acquire unavailable");
                TryAcquire::Unavailable
            }
        }
    }

    pub async fn renew(&self, name: &str, token: Uuid, ttl: Duration) -> Renewal {
        let ttl = self.clamp_ttl(ttl);
        match self.store.renew(name, token, ttl).await {
            Ok(RenewalOutcome::Renewed { expires_at }) => Renewal::Renewed { expires_at },
            Ok(RenewalOutcome::Lost) => Renewal::Lost,
            Err(e) => {
                error!(semaphore = %name, error = %e, "semaphore renew unavailable");
                Renewal::Unavailable
            }
        }
    }

    pub async fn release(&self, name: &str, token: Uuid) -> Release {
        match self.store.release(name, token).await {
            Ok(ReleaseOutcome::Released) => Release::Released,
            Ok(ReleaseOutcome::NotFound) => Release::NotFound,
            Err(e) => {
                error!(semaphore = %name, error = %e, "semaphore release unavailable");
                Release::Unavailable
            }
        }
    }
}
