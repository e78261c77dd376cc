//! Background maintenance loops: lease reaping and retention cleanup.
//!
//! These run independently of the dispatchers. The reaper returns orphaned
//! Processing rows (crashed or stalled workers) to the claimable state once
//! their lease elapses; the retention sweeper deletes terminal rows after a
//! configured window. Cadences are deliberately independent and both are
//! explicit configuration with documented defaults.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::semaphore::SemaphoreStore;
use crate::service::{idle, Service};
use crate::workqueue::{to_chrono, MessageQueue};

/// Cadence and sizing for the maintenance loops of one store.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often expired claims are reaped.
    pub reap_interval: Duration,
    /// Maximum rows recovered per reap pass.
    pub reap_batch: usize,
    /// Age past terminal state at which rows are deleted.
    pub retention_window: Duration,
    /// How often the retention sweep runs.
    pub sweep_interval: Duration,
    /// Maximum rows deleted per sweep pass.
    pub sweep_batch: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(30),
            reap_batch: 500,
            retention_window: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            sweep_batch: 1_000,
        }
    }
}

/// Returns expired claims to the claimable state on an interval.
pub struct Reaper<S: MessageQueue> {
    store: Arc<S>,
    interval: Duration,
    batch: usize,
    name: String,
}

impl<S: MessageQueue + 'static> Reaper<S> {
    pub fn new(store: Arc<S>, config: &MaintenanceConfig) -> Self {
        let name = format!("{}-reaper", store.queue_name());
        Self {
            store,
            interval: config.reap_interval,
            batch: config.reap_batch,
            name,
        }
    }
}

#[async_trait]
impl<S: MessageQueue + 'static> Service for Reaper<S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(reaper = %self.name, "reaper starting");
        while idle(&shutdown, self.interval).await {
            match self.store.reap_expired(self.batch).await {
                Ok(0) => {}
                Ok(recovered) => {
                    info!(reaper = %self.name, recovered, "recovered expired claims");
                }
                Err(e) => {
                    warn!(reaper = %self.name, error = %e, "reap pass failed");
                }
            }
        }
        info!(reaper = %self.name, "reaper stopped");
        Ok(())
    }
}

/// Deletes terminal rows older than the retention window.
pub struct RetentionSweeper<S: MessageQueue> {
    store: Arc<S>,
    window: Duration,
    interval: Duration,
    batch: usize,
    name: String,
}

impl<S: MessageQueue + 'static> RetentionSweeper<S> {
    pub fn new(store: Arc<S>, config: &MaintenanceConfig) -> Self {
        let name = format!("{}-retention", store.queue_name());
        Self {
            store,
            window: config.retention_window,
            interval: config.sweep_interval,
            batch: config.sweep_batch,
            name,
        }
    }
}

#[async_trait]
impl<S: MessageQueue + 'static> Service for RetentionSweeper<S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(sweeper = %self.name, "retention sweeper starting");
        while idle(&shutdown, self.interval).await {
            let cutoff = Utc::now() - to_chrono(self.window);
            match self.store.purge_terminal(cutoff, self.batch).await {
                Ok(0) => {}
                Ok(deleted) => {
                    debug!(sweeper = %self.name, deleted, cutoff = %cutoff, "purged terminal rows");
                }
                Err(e) => {
                    warn!(sweeper = %self.name, error = %e, "retention sweep failed");
                }
            }
        }
        info!(sweeper = %self.name, "retention sweeper stopped");
        Ok(())
    }
}

/// Bulk-reaps expired semaphore leases on an interval.
pub struct SemaphoreReaper<S> {
    store: Arc<S>,
    interval: Duration,
    batch: usize,
}

impl<S: SemaphoreStore + 'static> SemaphoreReaper<S> {
    pub fn new(store: Arc<S>, interval: Duration, batch: usize) -> Self {
        Self {
            store,
            interval,
            batch,
        }
    }
}

#[async_trait]
impl<S: SemaphoreStore + 'static> Service for SemaphoreReaper<S> {
    fn name(&self) -> &str {
        "semaphore-reaper"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!("semaphore reaper starting");
        while idle(&shutdown, self.interval).await {
            match self.store.reap_expired(None, self.batch).await {
                Ok(0) => {}
                Ok(deleted) => {
                    debug!(deleted, "reaped expired semaphore leases");
                }
                Err(e) => {
                    warn!(error = %e, "semaphore reap failed");
                }
            }
        }
        info!("semaphore reaper stopped");
        Ok(())
    }
}
