//! Single-holder distributed leases with fencing tokens.
//!
//! One row per resource name. Acquisition is an atomic insert-if-absent
//! plus conditional update: the lease changes hands only when it is free,
//! expired, or already held by the caller (re-entrant renewal). Every
//! successful acquire (including re-entrant ones) increments the row's
//! fencing token, so downstream systems can reject writes carrying a stale
//! token no matter how delayed the holder is.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::workqueue::OwnerToken;

/// Gate options for acquisition under extreme contention.
///
/// The gate is an advisory database-level named mutex held for the duration
/// of the acquire statement; it reduces wasted conditional updates but is
/// never required for correctness, and a gate timeout falls back to the
/// ungated path.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub use_gate: bool,
    pub gate_timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            use_gate: false,
            gate_timeout: Duration::from_millis(1000),
        }
    }
}

/// Result of an acquire call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller holds the lease; `fencing_token` is strictly greater than
    /// any token previously issued for this resource.
    Acquired { fencing_token: i64 },
    /// Another live holder has the lease.
    Held,
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired { .. })
    }
}

/// Result of a renew call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed { fencing_token: i64 },
    /// The caller no longer owns the lease.
    Lost,
}

/// A lease row, for inspection and tests.
#[derive(Debug, Clone)]
pub struct LeaseRecord {
    pub resource_name: String,
    pub owner_token: Option<OwnerToken>,
    pub lease_until: Option<DateTime<Utc>>,
    pub fencing_token: i64,
    pub context: Option<Value>,
}

impl LeaseRecord {
    /// Whether the row currently has a live holder.
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        self.owner_token.is_some() && self.lease_until.is_some_and(|until| until > now)
    }
}

/// Storage for single-holder leases.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquires or re-entrantly renews the lease for `name`. On success the
    /// fencing token has been incremented and is returned.
    async fn acquire(
        &self,
        name: &str,
        owner: OwnerToken,
        ttl: Duration,
        context: Option<Value>,
    ) -> Result<AcquireOutcome>;

    /// Extends the lease iff `owner` still holds the row; bumps fencing.
    async fn renew(&self, name: &str, owner: OwnerToken, ttl: Duration) -> Result<RenewOutcome>;

    /// Releases the lease iff `owner` holds it. Returns whether a release
    /// happened. The fencing counter survives for the lifetime of the row.
    async fn release(&self, name: &str, owner: OwnerToken) -> Result<bool>;

    async fn get(&self, name: &str) -> Result<Option<LeaseRecord>>;
}

/// Keeps a held lease alive by renewing at a fraction of its TTL.
///
/// On renewal failure (lease lost, or storage errors outlasting the TTL)
/// the keeper cancels its loss token so dependent work can stop promptly.
pub struct LeaseKeeper {
    task: tokio::task::JoinHandle<()>,
    stop: CancellationToken,
    lost: CancellationToken,
}

impl LeaseKeeper {
    /// Spawns a renewal loop for a lease the caller already holds.
    ///
    /// `fraction` is the portion of the TTL to sleep between renewals; 0.5
    /// to 0.6 is a sensible range.
    pub fn spawn<S: LeaseStore + 'static>(
        store: Arc<S>,
        name: impl Into<String>,
        owner: OwnerToken,
        ttl: Duration,
        fraction: f64,
    ) -> Self {
        let name = name.into();
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let period = ttl.mul_f64(fraction.clamp(0.1, 0.9));

        let loop_stop = stop.clone();
        let loop_lost = lost.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_stop.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                match store.renew(&name, owner, ttl).await {
                    Ok(RenewOutcome::Renewed { fencing_token }) => {
                        debug!(resource = %name, fencing = fencing_token, "lease renewed");
                    }
                    Ok(RenewOutcome::Lost) => {
                        warn!(resource = %name, "lease lost");
                        loop_lost.cancel();
                        break;
                    }
                    Err(e) => {
                        // Storage hiccup; retry on the next period. If the
                        // TTL lapses meanwhile another holder will take the
                        // lease and the next renew reports Lost.
                        warn!(resource = %name, error = %e, "lease renewal errored");
                    }
                }
            }
        });

        Self { task, stop, lost }
    }

    /// Cancelled when the lease can no longer be assumed held.
    pub fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Stops the renewal loop. Does not release the lease.
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}
