//! The dispatcher loop: claim a batch, run handlers, settle each row.
//!
//! One dispatcher serves one store. Each cycle claims up to `batch_size`
//! rows under a fresh owner token, runs the registered handler for every
//! row concurrently, and settles each row by its outcome: ack on success,
//! abandon with backoff on a transient failure with budget remaining, fail
//! on a permanent failure or an exhausted budget.
//!
//! A heartbeat co-task renews each row's lease at a fraction of the lease
//! duration while its handler runs; if renewal reports the lease gone (the
//! row was reaped and re-claimed), the handler's context is cancelled and
//! its eventual settle becomes a silent no-op through the owner guard.
//! Storage errors never crash the loop: the claim is retried after a short
//! sleep and lease expiry hands anything in flight to the reaper.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::error::{CoordinationError, FailureKind};
use crate::handler::{DispatchMessage, HandlerContext, HandlerRegistry};
use crate::service::{idle, Service};
use crate::workqueue::{to_chrono, ClaimedMessage, MessageQueue, OwnerToken};

/// Configuration for one dispatcher loop.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum rows claimed per cycle.
    pub batch_size: usize,
    /// Claim lock duration.
    pub lease: Duration,
    /// Renew the claim at this fraction of the lease.
    pub heartbeat_fraction: f64,
    /// Sleep after an empty claim starts here and doubles per idle cycle.
    pub min_poll_interval: Duration,
    /// Cap on the adaptive idle sleep.
    pub max_poll_interval: Duration,
    /// Transient failures past this attempt count become permanent.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Worker identity for logs.
    pub worker_id: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            lease: Duration::from_secs(60),
            heartbeat_fraction: 0.5,
            min_poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_secs(30),
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), CoordinationError> {
        crate::error::ensure_batch_size(self.batch_size)?;
        if self.lease.is_zero() {
            return Err(CoordinationError::InvalidConfig {
                message: "lease must be positive".to_string(),
            });
        }
        if !(self.heartbeat_fraction > 0.0 && self.heartbeat_fraction < 1.0) {
            return Err(CoordinationError::InvalidConfig {
                message: format!(
                    "heartbeat_fraction {} must be in (0, 1)",
                    self.heartbeat_fraction
                ),
            });
        }
        if self.min_poll_interval > self.max_poll_interval {
            return Err(CoordinationError::InvalidConfig {
                message: "min_poll_interval exceeds max_poll_interval".to_string(),
            });
        }
        if self.max_attempts == 0 {
            return Err(CoordinationError::InvalidConfig {
                message: "max_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// A dispatcher loop over one message store.
pub struct Dispatcher<S: MessageQueue> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    config: DispatcherConfig,
    name: String,
}

impl<S: MessageQueue + 'static> Dispatcher<S> {
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry>, config: DispatcherConfig) -> Self {
        let name = format!("{}-dispatcher", store.queue_name());
        Self {
            store,
            registry,
            config,
            name,
        }
    }

    /// Runs one handler with a heartbeat co-task and settles the row.
    async fn process_message(
        &self,
        owner: OwnerToken,
        claimed: ClaimedMessage<S::Id>,
        shutdown: &CancellationToken,
    ) {
        let id = claimed.id.clone();
        let topic = claimed.topic.clone();
        let queue = self.store.queue_name();

        let Some(handler) = self.registry.get(&topic) else {
            warn!(queue, id = %id, topic = %topic, "no handler registered, dead-lettering");
            let reason = format!("no handler registered for topic `{topic}`");
            if let Err(e) = self.store.fail(owner, &[id.clone()], Some(&reason)).await {
                error!(queue, id = %id, error = %e, "failed to dead-letter row");
            }
            return;
        };

        let job_cancel = shutdown.child_token();
        let heartbeat = self.spawn_heartbeat(owner, id.clone(), job_cancel.clone());

        let message = DispatchMessage::from_claimed(&claimed);
        let ctx = HandlerContext {
            cancellation: job_cancel.clone(),
            queue,
        };
        let outcome = handler.handle(message, ctx).await;

        job_cancel.cancel();
        let _ = heartbeat.await;

        match outcome {
            Ok(()) => {
                debug!(queue, id = %id, topic = %topic, "message dispatched");
                if let Err(e) = self.store.ack(owner, &[id.clone()]).await {
                    error!(queue, id = %id, error = %e, "ack failed");
                }
            }
            Err(failure) => {
                let attempts_done = claimed.attempt.saturating_add(1);
                let exhausted = attempts_done >= self.config.max_attempts as i32;
                let description = failure.to_string();

                if failure.kind() == FailureKind::Permanent || exhausted {
                    warn!(
                        queue, id = %id, topic = %topic, attempts = attempts_done,
                        error = %description, "dead-lettering message"
                    );
                    let reason = if failure.kind() == FailureKind::Permanent {
                        description
                    } else {
                        format!("max attempts exceeded: {description}")
                    };
                    if let Err(e) = self.store.fail(owner, &[id.clone()], Some(&reason)).await {
                        error!(queue, id = %id, error = %e, "fail transition errored");
                    }
                } else {
                    let delay = self.config.backoff.delay_for(claimed.attempt.max(0) as u32);
                    let retry_at = Utc::now() + to_chrono(delay);
                    warn!(
                        queue, id = %id, topic = %topic, attempts = attempts_done,
                        retry_at = %retry_at, error = %description, "abandoning message for retry"
                    );
                    if let Err(e) = self
                        .store
                        .abandon(owner, &[id.clone()], Some(&description), Some(retry_at))
                        .await
                    {
                        error!(queue, id = %id, error = %e, "abandon transition errored");
                    }
                }
            }
        }
    }

    /// Renews the claim lease while the handler runs. Cancels `job_cancel`
    /// if the lease is lost so the handler stops and its settle no-ops.
    fn spawn_heartbeat(
        &self,
        owner: OwnerToken,
        id: S::Id,
        job_cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let lease = self.config.lease;
        let period = lease.mul_f64(self.config.heartbeat_fraction);
        let queue = self.store.queue_name();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));
            interval.tick().await; // skip the immediate tick

            loop {
                tokio::select! {
                    _ = job_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match store.extend_lease(owner, &[id.clone()], lease).await {
                            Ok(extended) if extended.is_empty() => {
                                warn!(queue, id = %id, "lease lost, cancelling handler");
                                job_cancel.cancel();
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                // Transient storage problem; the reaper
                                // covers us if the lease actually lapses.
                                warn!(queue, id = %id, error = %e, "heartbeat failed");
                            }
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl<S: MessageQueue + 'static> Service for Dispatcher<S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;
        info!(
            dispatcher = %self.name,
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            "dispatcher starting"
        );

        let mut poll_interval = self.config.min_poll_interval;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let owner = OwnerToken::generate();
            let batch = match self
                .store
                .claim(owner, self.config.batch_size, self.config.lease)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    error!(dispatcher = %self.name, error = %e, "claim failed");
                    if !idle(&shutdown, Duration::from_secs(1)).await {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                if !idle(&shutdown, poll_interval).await {
                    break;
                }
                poll_interval = (poll_interval * 2).min(self.config.max_poll_interval);
                continue;
            }

            poll_interval = self.config.min_poll_interval;
            debug!(dispatcher = %self.name, count = batch.len(), "claimed batch");

            let work = batch
                .into_iter()
                .map(|claimed| self.process_message(owner, claimed, &shutdown));
            futures::future::join_all(work).await;
        }

        info!(dispatcher = %self.name, "dispatcher stopped");
        Ok(())
    }
}
