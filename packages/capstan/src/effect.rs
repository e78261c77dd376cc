//! Exactly-once envelope for non-idempotent external calls.
//!
//! A durable row per `(operation_name, idempotency_key)` records whether
//! the external call ever succeeded. `execute` wraps the call: it consults
//! the persisted status, optionally probes the external system when a prior
//! attempt's fate is unknown, takes a conditional attempt lock so no two
//! workers run the call concurrently, and records the result. The caller
//! learns one of four outcomes and retries only when told to.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ensure_name, FailureKind, HandlerFailure};

/// What to do when an external probe cannot determine whether a previous
/// attempt took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownCheckBehavior {
    /// Proceed to a fresh attempt. Only safe when the external call is
    /// tolerant of duplicates.
    Attempt,
    /// Schedule a retry and probe again later.
    #[default]
    RetryLater,
}

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct EffectConfig {
    /// Attempt lock duration; a crashed worker blocks the key for at most
    /// this long.
    pub lock_duration: Duration,
    /// Minimum spacing between external probes for one key.
    pub min_check_interval: Duration,
    pub unknown_check_behavior: UnknownCheckBehavior,
}

impl Default for EffectConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(60),
            min_check_interval: Duration::from_secs(30),
            unknown_check_behavior: UnknownCheckBehavior::default(),
        }
    }
}

/// Identity of one external side effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EffectKey {
    pub operation_name: String,
    pub idempotency_key: String,
}

impl EffectKey {
    pub fn new(operation_name: impl Into<String>, idempotency_key: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            idempotency_key: idempotency_key.into(),
        }
    }
}

/// Persisted status. Fixed integer codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectStatus {
    Pending,
    Succeeded,
    Failed,
}

impl EffectStatus {
    pub fn code(self) -> i16 {
        match self {
            EffectStatus::Pending => 0,
            EffectStatus::Succeeded => 1,
            EffectStatus::Failed => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(EffectStatus::Pending),
            1 => Some(EffectStatus::Succeeded),
            2 => Some(EffectStatus::Failed),
            _ => None,
        }
    }
}

/// A side-effect row.
#[derive(Debug, Clone)]
pub struct EffectRecord {
    pub id: Uuid,
    pub operation_name: String,
    pub idempotency_key: String,
    pub status: EffectStatus,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_external_check_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub external_reference_id: Option<String>,
    pub external_status: Option<String>,
    pub last_error: Option<String>,
    pub payload_hash: Option<Vec<u8>>,
}

/// Result the caller's execute future reports on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EffectSuccess {
    /// Identifier the external system assigned (transfer id, resource id).
    pub external_reference_id: Option<String>,
    pub external_status: Option<String>,
}

/// Result of an external probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The external system confirms a prior attempt took effect.
    Confirmed(EffectSuccess),
    /// The external system has no trace of the operation; attempting is
    /// safe.
    NotFound,
    /// Inconclusive; resolved by [`UnknownCheckBehavior`].
    Unknown,
}

/// What `execute` reports to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectOutcome {
    /// A previous execution already succeeded; nothing ran.
    AlreadyCompleted,
    /// This invocation ran the call to success (or confirmed it via the
    /// probe).
    Completed,
    /// Nothing definitive happened; retry later. Covers a concurrent
    /// holder's lock, an inconclusive probe, and transient failures.
    RetryScheduled,
    /// The operation is permanently failed; retrying is pointless.
    PermanentFailure,
}

/// Storage for side-effect rows.
#[async_trait]
pub trait EffectStore: Send + Sync {
    /// Fetches the row for `key`, creating it in Pending state on first
    /// sight.
    async fn get_or_create(
        &self,
        key: &EffectKey,
        payload_hash: Option<&[u8]>,
    ) -> Result<EffectRecord>;

    /// Conditionally takes the attempt lock: succeeds iff the row is
    /// Pending and unlocked (or the lock expired). Increments the attempt
    /// count on success.
    async fn try_begin_attempt(
        &self,
        id: Uuid,
        worker: &str,
        lock_duration: Duration,
    ) -> Result<bool>;

    async fn mark_succeeded(&self, id: Uuid, success: &EffectSuccess) -> Result<()>;

    /// Records a failure. Permanent failures move the row to Failed;
    /// transient ones leave it Pending with the lock released so a later
    /// attempt can run.
    async fn mark_failed(&self, id: Uuid, error: &str, kind: FailureKind) -> Result<()>;

    /// Stamps `last_external_check_at`.
    async fn record_check(&self, id: Uuid) -> Result<()>;

    async fn get(&self, key: &EffectKey) -> Result<Option<EffectRecord>>;
}

/// The envelope. One instance per worker process.
pub struct SideEffects<S> {
    store: Arc<S>,
    config: EffectConfig,
    worker_id: String,
}

impl<S: EffectStore> SideEffects<S> {
    pub fn new(store: Arc<S>, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            config: EffectConfig::default(),
            worker_id: worker_id.into(),
        }
    }

    pub fn with_config(mut self, config: EffectConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Runs `run` at most once to success for `key`.
    ///
    /// `check` probes the external system when a prior attempt exists and
    /// the probe interval elapsed; supply it whenever the external system
    /// can answer "did operation X happen" (it turns ambiguous crashes into
    /// definite outcomes instead of duplicate calls).
    pub async fn execute<C, R>(
        &self,
        key: EffectKey,
        check: Option<C>,
        run: R,
    ) -> Result<EffectOutcome>
    where
        C: Future<Output = Result<CheckOutcome>> + Send,
        R: Future<Output = Result<EffectSuccess, HandlerFailure>> + Send,
    {
        ensure_name(&key.operation_name)?;
        ensure_name(&key.idempotency_key)?;

        let record = self.store.get_or_create(&key, None).await?;
        match record.status {
            EffectStatus::Succeeded => return Ok(EffectOutcome::AlreadyCompleted),
            EffectStatus::Failed => return Ok(EffectOutcome::PermanentFailure),
            EffectStatus::Pending => {}
        }

        if let Some(check) = check {
            if record.attempt_count > 0 && self.check_due(&record) {
                self.store.record_check(record.id).await?;
                match check.await {
                    Ok(CheckOutcome::Confirmed(success)) => {
                        debug!(
                            operation = %key.operation_name,
                            idempotency_key = %key.idempotency_key,
                            "external probe confirmed prior attempt"
                        );
                        self.store.mark_succeeded(record.id, &success).await?;
                        return Ok(EffectOutcome::Completed);
                    }
                    Ok(CheckOutcome::NotFound) => {}
                    Ok(CheckOutcome::Unknown) | Err(_) => {
                        match self.config.unknown_check_behavior {
                            UnknownCheckBehavior::RetryLater => {
                                return Ok(EffectOutcome::RetryScheduled);
                            }
                            UnknownCheckBehavior::Attempt => {}
                        }
                    }
                }
            }
        }

        let locked = self
            .store
            .try_begin_attempt(record.id, &self.worker_id, self.config.lock_duration)
            .await?;
        if !locked {
            return Ok(EffectOutcome::RetryScheduled);
        }

        match run.await {
            Ok(success) => {
                self.store.mark_succeeded(record.id, &success).await?;
                Ok(EffectOutcome::Completed)
            }
            Err(failure) => {
                let description = failure.to_string();
                warn!(
                    operation = %key.operation_name,
                    idempotency_key = %key.idempotency_key,
                    error = %description,
                    "external call failed"
                );
                self.store
                    .mark_failed(record.id, &description, failure.kind())
                    .await?;
                match failure.kind() {
                    FailureKind::Permanent => Ok(EffectOutcome::PermanentFailure),
                    FailureKind::Transient => Ok(EffectOutcome::RetryScheduled),
                }
            }
        }
    }

    fn check_due(&self, record: &EffectRecord) -> bool {
        match record.last_external_check_at {
            None => true,
            Some(last) => {
                Utc::now() - last >= crate::workqueue::to_chrono(self.config.min_check_interval)
            }
        }
    }
}
