//! Long-running background services and their host.
//!
//! Every loop in this crate (dispatchers, reapers, retention sweepers, the
//! scheduler planner, provider refresh) implements [`Service`]: a named task
//! that runs until its shutdown token cancels. [`ServiceHost`] spawns a set
//! of services and joins them on shutdown with a bounded wait.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A long-running background task with cooperative shutdown.
#[async_trait]
pub trait Service: Send + 'static {
    /// Stable name for logs.
    fn name(&self) -> &str;

    /// Runs until `shutdown` cancels. Implementations must observe the
    /// token promptly in every sleep and blocking call.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Sleeps unless the token cancels first. Returns false on cancellation.
pub async fn idle(shutdown: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Runs a set of services and coordinates their shutdown.
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    shutdown: CancellationToken,
    shutdown_grace: Duration,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            shutdown: CancellationToken::new(),
            shutdown_grace: Duration::from_secs(30),
        }
    }

    pub fn with_service(mut self, service: impl Service) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Maximum time to wait for services after shutdown is triggered.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Token that stops every hosted service when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawns every service and waits for all of them to exit. Returns once
    /// the shutdown token has been cancelled and every service finished (or
    /// the grace period elapsed).
    pub async fn run(self) -> Result<()> {
        let mut handles: Vec<(String, JoinHandle<()>)> = Vec::with_capacity(self.services.len());

        for service in self.services {
            let name = service.name().to_string();
            let token = self.shutdown.clone();
            info!(service = %name, "starting service");
            let task_name = name.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = service.run(token).await {
                    error!(service = %task_name, error = %e, "service exited with error");
                }
            });
            handles.push((name, handle));
        }

        self.shutdown.cancelled().await;
        info!("shutdown triggered, waiting for services");

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        for (name, handle) in handles {
            tokio::select! {
                result = handle => {
                    if let Err(e) = result {
                        error!(service = %name, error = %e, "service task panicked");
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(service = %name, "service did not stop within the grace period");
                }
            }
        }

        info!("all services stopped");
        Ok(())
    }
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}
