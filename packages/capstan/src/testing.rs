//! In-memory store implementations for tests.
//!
//! Every store trait in this crate has an in-memory twin here with the same
//! transition semantics as the SQL implementations: owner-guarded
//! transitions, lease expiry, join bookkeeping, fencing monotonicity. They
//! let dispatcher loops, lease keepers, and coordination flows be exercised
//! in plain `#[tokio::test]`s without a database.
//!
//! These are test tooling, not a production queue: state lives in process
//! memory and is lost on drop.
//!
//! # Feature Flag
//!
//! Available with the `testing` feature (and always inside this crate's own
//! tests):
//!
//! ```toml
//! [dev-dependencies]
//! capstan = { version = "0.1", features = ["testing"] }
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::cron::{self, CatchUpPolicy};
use crate::effect::{EffectKey, EffectRecord, EffectStatus, EffectStore, EffectSuccess};
use crate::error::{ensure_batch_size, ensure_name, CoordinationError, FailureKind};
use crate::inbox::{ensure_message_id, InboxRecord, InboxStore, ObserveOutcome, ObservedMessage};
use crate::join::{
    hold_due_time, terminal_status, JoinEnqueued, JoinFirePolicy, JoinMemberRecord, JoinRecord,
    JoinStatus, JoinStore,
};
use crate::lease::{AcquireOutcome, LeaseRecord, LeaseStore, RenewOutcome};
use crate::outbox::{EnqueueOutcome, NewOutboxMessage, OutboxRecord, OutboxStore};
use crate::scheduler::{
    CronJobStore, JobDefinition, JobRunRecord, JobSpec, NewTimer, TimerRecord, TimerStore,
};
use crate::semaphore::{
    ReleaseOutcome, RenewalOutcome, SemaphoreLease, SemaphoreStore, TryAcquireOutcome,
};
use crate::workqueue::{
    to_chrono, ClaimedMessage, InboxStatus, MessageQueue, MessageStatus, OwnerToken, QueueStats,
};

// =============================================================================
// Outbox (with join bookkeeping)
// =============================================================================

#[derive(Default)]
struct OutboxInner {
    rows: HashMap<Uuid, OutboxRecord>,
    by_message_id: HashMap<Uuid, Uuid>,
    joins: HashMap<Uuid, JoinRecord>,
    members: HashMap<Uuid, Vec<JoinMemberRecord>>,
    member_join: HashMap<Uuid, Uuid>,
}

/// In-memory [`OutboxStore`] with full join bookkeeping.
pub struct MemoryOutboxStore {
    inner: Mutex<OutboxInner>,
    fire_policy: JoinFirePolicy,
}

impl Default for MemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_fire_policy(JoinFirePolicy::default())
    }

    pub fn with_fire_policy(fire_policy: JoinFirePolicy) -> Self {
        Self {
            inner: Mutex::new(OutboxInner::default()),
            fire_policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutboxInner> {
        self.inner.lock().expect("outbox lock poisoned")
    }

    fn insert_row(inner: &mut OutboxInner, message: NewOutboxMessage, join_id: Option<Uuid>) -> Result<Uuid> {
        ensure_name(&message.topic)?;
        let message_id = message.message_id.unwrap_or_else(Uuid::new_v4);
        if inner.by_message_id.contains_key(&message_id) {
            return Err(anyhow!("outbox message_id {message_id} already exists"));
        }
        let id = Uuid::new_v4();
        let record = OutboxRecord {
            id,
            topic: message.topic,
            payload: message.payload,
            message_id,
            correlation_id: message.correlation_id,
            created_at: Utc::now(),
            due_time: message.due_time,
            status: MessageStatus::Pending,
            locked_until: None,
            owner_token: None,
            attempt_count: 0,
            last_error: None,
            processed_at: None,
            join_id,
        };
        inner.by_message_id.insert(message_id, id);
        inner.rows.insert(id, record);
        Ok(id)
    }

    /// Marks the member for `outbox_id`, bumps the join counter once, and
    /// releases the held parent when the barrier fires.
    fn settle_member(
        inner: &mut OutboxInner,
        outbox_id: Uuid,
        completed: bool,
        now: DateTime<Utc>,
        fire_policy: JoinFirePolicy,
    ) {
        let Some(join_id) = inner.member_join.get(&outbox_id).copied() else {
            return;
        };

        // Member transitions at most once.
        let transitioned = match inner
            .members
            .get_mut(&join_id)
            .and_then(|members| members.iter_mut().find(|m| m.outbox_message_id == outbox_id))
        {
            Some(member) if member.completed_at.is_none() && member.failed_at.is_none() => {
                if completed {
                    member.completed_at = Some(now);
                } else {
                    member.failed_at = Some(now);
                }
                true
            }
            _ => false,
        };
        if !transitioned {
            return;
        }

        let Some(join) = inner.joins.get_mut(&join_id) else {
            return;
        };
        // Counters stop once the join is terminal; never overshoot.
        if join.status.is_terminal()
            || join.completed_steps + join.failed_steps >= join.expected_steps
        {
            return;
        }
        if completed {
            join.completed_steps += 1;
        } else {
            join.failed_steps += 1;
        }
        join.last_updated_at = now;

        let settled = join.completed_steps + join.failed_steps == join.expected_steps;
        let fire = match fire_policy {
            JoinFirePolicy::AllSettled => settled,
            JoinFirePolicy::EarlyOnFailure => settled || !completed,
        };
        if fire {
            join.status = terminal_status(join.failed_steps);
            let parent_id = join.parent_outbox_id;
            if let Some(parent) = inner.rows.get_mut(&parent_id) {
                if parent.status == MessageStatus::Pending {
                    parent.due_time = Some(now);
                }
            }
        }
    }
}

#[async_trait]
impl MessageQueue for MemoryOutboxStore {
    type Id = Uuid;

    fn queue_name(&self) -> &'static str {
        "outbox"
    }

    async fn claim(
        &self,
        owner: OwnerToken,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedMessage<Uuid>>> {
        ensure_batch_size(batch_size)?;
        let now = Utc::now();
        let mut inner = self.lock();

        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = inner
            .rows
            .values()
            .filter(|row| {
                row.status == MessageStatus::Pending
                    && row.due_time.map_or(true, |due| due <= now)
                    && row.locked_until.map_or(true, |until| until <= now)
            })
            .map(|row| (row.due_time.unwrap_or(row.created_at), row.id))
            .collect();
        candidates.sort();
        candidates.truncate(batch_size);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(row) = inner.rows.get_mut(&id) {
                row.status = MessageStatus::Processing;
                row.owner_token = Some(owner);
                row.locked_until = Some(now + to_chrono(lease));
                claimed.push(ClaimedMessage {
                    id: row.id,
                    topic: row.topic.clone(),
                    payload: row.payload.clone(),
                    dedup_id: Some(row.message_id.to_string()),
                    correlation_id: row.correlation_id.clone(),
                    attempt: row.attempt_count,
                });
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, owner: OwnerToken, ids: &[Uuid]) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.lock();
        for id in ids {
            let owned = matches!(
                inner.rows.get(id),
                Some(row) if row.status == MessageStatus::Processing && row.owner_token == Some(owner)
            );
            if !owned {
                continue;
            }
            if let Some(row) = inner.rows.get_mut(id) {
                row.status = MessageStatus::Dispatched;
                row.processed_at = Some(now);
                row.owner_token = None;
                row.locked_until = None;
            }
            Self::settle_member(&mut inner, *id, true, now, self.fire_policy);
        }
        Ok(())
    }

    async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[Uuid],
        last_error: Option<&str>,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.lock();
        for id in ids {
            if let Some(row) = inner.rows.get_mut(id) {
                if row.status == MessageStatus::Processing && row.owner_token == Some(owner) {
                    row.status = MessageStatus::Pending;
                    row.attempt_count += 1;
                    row.owner_token = None;
                    row.locked_until = None;
                    if let Some(error) = last_error {
                        row.last_error = Some(error.to_string());
                    }
                    if retry_at.is_some() {
                        row.due_time = retry_at;
                    }
                }
            }
        }
        Ok(())
    }

    async fn fail(&self, owner: OwnerToken, ids: &[Uuid], reason: Option<&str>) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.lock();
        for id in ids {
            let owned = matches!(
                inner.rows.get(id),
                Some(row) if row.status == MessageStatus::Processing && row.owner_token == Some(owner)
            );
            if !owned {
                continue;
            }
            if let Some(row) = inner.rows.get_mut(id) {
                row.status = MessageStatus::Failed;
                row.processed_at = Some(now);
                row.owner_token = None;
                row.locked_until = None;
                if let Some(reason) = reason {
                    row.last_error = Some(reason.to_string());
                }
            }
            Self::settle_member(&mut inner, *id, false, now, self.fire_policy);
        }
        Ok(())
    }

    async fn extend_lease(
        &self,
        owner: OwnerToken,
        ids: &[Uuid],
        lease: Duration,
    ) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let mut inner = self.lock();
        let mut extended = Vec::new();
        for id in ids {
            if let Some(row) = inner.rows.get_mut(id) {
                if row.status == MessageStatus::Processing && row.owner_token == Some(owner) {
                    row.locked_until = Some(now + to_chrono(lease));
                    extended.push(*id);
                }
            }
        }
        Ok(extended)
    }

    async fn reap_expired(&self, limit: usize) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.lock();
        let expired: Vec<Uuid> = inner
            .rows
            .values()
            .filter(|row| {
                row.status == MessageStatus::Processing
                    && row.locked_until.map_or(false, |until| until <= now)
            })
            .map(|row| row.id)
            .take(limit)
            .collect();
        for id in &expired {
            if let Some(row) = inner.rows.get_mut(id) {
                row.status = MessageStatus::Pending;
                row.owner_token = None;
                row.locked_until = None;
            }
        }
        Ok(expired.len() as u64)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>, limit: usize) -> Result<u64> {
        let mut inner = self.lock();
        let purgeable: Vec<Uuid> = inner
            .rows
            .values()
            .filter(|row| {
                row.status.is_terminal()
                    && row.processed_at.map_or(false, |at| at < older_than)
            })
            .map(|row| row.id)
            .take(limit)
            .collect();
        for id in &purgeable {
            if let Some(row) = inner.rows.remove(id) {
                inner.by_message_id.remove(&row.message_id);
            }
        }
        Ok(purgeable.len() as u64)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let inner = self.lock();
        let mut stats = QueueStats::default();
        for row in inner.rows.values() {
            match row.status {
                MessageStatus::Pending => stats.pending += 1,
                MessageStatus::Processing => stats.processing += 1,
                MessageStatus::Dispatched => stats.dispatched += 1,
                MessageStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn enqueue(&self, message: NewOutboxMessage) -> Result<EnqueueOutcome> {
        ensure_name(&message.topic)?;
        let mut inner = self.lock();
        if let Some(message_id) = message.message_id {
            if let Some(existing) = inner.by_message_id.get(&message_id) {
                return Ok(EnqueueOutcome::Duplicate(*existing));
            }
        }
        let id = Self::insert_row(&mut inner, message, None)?;
        Ok(EnqueueOutcome::Created(id))
    }

    async fn enqueue_join(
        &self,
        parent: NewOutboxMessage,
        children: Vec<NewOutboxMessage>,
        expected_steps: u32,
    ) -> Result<JoinEnqueued> {
        if expected_steps == 0 || expected_steps as usize > children.len() {
            return Err(CoordinationError::InvalidExpectedSteps {
                expected: expected_steps,
                members: children.len(),
            }
            .into());
        }
        let now = Utc::now();
        let join_id = Uuid::new_v4();
        let owner_key = parent
            .correlation_id
            .clone()
            .unwrap_or_else(|| parent.topic.clone());

        let mut inner = self.lock();
        let held_parent = NewOutboxMessage {
            due_time: Some(hold_due_time()),
            ..parent
        };
        let parent_id = Self::insert_row(&mut inner, held_parent, Some(join_id))?;

        let mut child_ids = Vec::with_capacity(children.len());
        let mut members = Vec::with_capacity(children.len());
        for child in children {
            let child_id = Self::insert_row(&mut inner, child, Some(join_id))?;
            members.push(JoinMemberRecord {
                join_id,
                outbox_message_id: child_id,
                created_at: now,
                completed_at: None,
                failed_at: None,
            });
            inner.member_join.insert(child_id, join_id);
            child_ids.push(child_id);
        }

        inner.joins.insert(
            join_id,
            JoinRecord {
                join_id,
                owner_key,
                expected_steps,
                completed_steps: 0,
                failed_steps: 0,
                status: JoinStatus::Pending,
                created_at: now,
                last_updated_at: now,
                metadata: None,
                parent_outbox_id: parent_id,
            },
        );
        inner.members.insert(join_id, members);

        Ok(JoinEnqueued {
            parent_id,
            join_id,
            child_ids,
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxRecord>> {
        Ok(self.lock().rows.get(&id).cloned())
    }
}

#[async_trait]
impl JoinStore for MemoryOutboxStore {
    async fn get_join(&self, join_id: Uuid) -> Result<Option<JoinRecord>> {
        Ok(self.lock().joins.get(&join_id).cloned())
    }

    async fn join_members(&self, join_id: Uuid) -> Result<Vec<JoinMemberRecord>> {
        Ok(self.lock().members.get(&join_id).cloned().unwrap_or_default())
    }
}

// =============================================================================
// Inbox
// =============================================================================

/// In-memory [`InboxStore`].
#[derive(Default)]
pub struct MemoryInboxStore {
    inner: Mutex<HashMap<String, InboxRecord>>,
}

impl MemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, InboxRecord>> {
        self.inner.lock().expect("inbox lock poisoned")
    }
}

#[async_trait]
impl MessageQueue for MemoryInboxStore {
    type Id = String;

    fn queue_name(&self) -> &'static str {
        "inbox"
    }

    async fn claim(
        &self,
        owner: OwnerToken,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedMessage<String>>> {
        ensure_batch_size(batch_size)?;
        let now = Utc::now();
        let mut rows = self.lock();

        let mut candidates: Vec<(DateTime<Utc>, String)> = rows
            .values()
            .filter(|row| {
                row.status == InboxStatus::Seen
                    && row.topic.is_some()
                    && row.due_time.map_or(true, |due| due <= now)
                    && row.locked_until.map_or(true, |until| until <= now)
            })
            .map(|row| {
                (
                    row.due_time.unwrap_or(row.first_seen_at),
                    row.message_id.clone(),
                )
            })
            .collect();
        candidates.sort();
        candidates.truncate(batch_size);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, message_id) in candidates {
            if let Some(row) = rows.get_mut(&message_id) {
                row.status = InboxStatus::Processing;
                row.owner_token = Some(owner);
                row.locked_until = Some(now + to_chrono(lease));
                claimed.push(ClaimedMessage {
                    id: row.message_id.clone(),
                    topic: row.topic.clone().unwrap_or_default(),
                    payload: row.payload.clone().unwrap_or(Value::Null),
                    dedup_id: Some(row.message_id.clone()),
                    correlation_id: None,
                    attempt: row.attempts,
                });
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, owner: OwnerToken, ids: &[String]) -> Result<()> {
        let now = Utc::now();
        let mut rows = self.lock();
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                if row.status == InboxStatus::Processing && row.owner_token == Some(owner) {
                    row.status = InboxStatus::Done;
                    row.processed_at = Some(now);
                    row.owner_token = None;
                    row.locked_until = None;
                }
            }
        }
        Ok(())
    }

    async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[String],
        last_error: Option<&str>,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut rows = self.lock();
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                if row.status == InboxStatus::Processing && row.owner_token == Some(owner) {
                    row.status = InboxStatus::Seen;
                    row.attempts += 1;
                    row.owner_token = None;
                    row.locked_until = None;
                    if let Some(error) = last_error {
                        row.last_error = Some(error.to_string());
                    }
                    if retry_at.is_some() {
                        row.due_time = retry_at;
                    }
                }
            }
        }
        Ok(())
    }

    async fn fail(&self, owner: OwnerToken, ids: &[String], reason: Option<&str>) -> Result<()> {
        let now = Utc::now();
        let mut rows = self.lock();
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                if row.status == InboxStatus::Processing && row.owner_token == Some(owner) {
                    row.status = InboxStatus::Dead;
                    row.processed_at = Some(now);
                    row.owner_token = None;
                    row.locked_until = None;
                    if let Some(reason) = reason {
                        row.last_error = Some(reason.to_string());
                    }
                }
            }
        }
        Ok(())
    }

    async fn extend_lease(
        &self,
        owner: OwnerToken,
        ids: &[String],
        lease: Duration,
    ) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut rows = self.lock();
        let mut extended = Vec::new();
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                if row.status == InboxStatus::Processing && row.owner_token == Some(owner) {
                    row.locked_until = Some(now + to_chrono(lease));
                    extended.push(id.clone());
                }
            }
        }
        Ok(extended)
    }

    async fn reap_expired(&self, limit: usize) -> Result<u64> {
        let now = Utc::now();
        let mut rows = self.lock();
        let expired: Vec<String> = rows
            .values()
            .filter(|row| {
                row.status == InboxStatus::Processing
                    && row.locked_until.map_or(false, |until| until <= now)
            })
            .map(|row| row.message_id.clone())
            .take(limit)
            .collect();
        for id in &expired {
            if let Some(row) = rows.get_mut(id) {
                row.status = InboxStatus::Seen;
                row.owner_token = None;
                row.locked_until = None;
            }
        }
        Ok(expired.len() as u64)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>, limit: usize) -> Result<u64> {
        let mut rows = self.lock();
        let purgeable: Vec<String> = rows
            .values()
            .filter(|row| {
                row.status.is_terminal() && row.processed_at.map_or(false, |at| at < older_than)
            })
            .map(|row| row.message_id.clone())
            .take(limit)
            .collect();
        for id in &purgeable {
            rows.remove(id);
        }
        Ok(purgeable.len() as u64)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows = self.lock();
        let mut stats = QueueStats::default();
        for row in rows.values() {
            match row.status {
                InboxStatus::Seen => stats.pending += 1,
                InboxStatus::Processing => stats.processing += 1,
                InboxStatus::Done => stats.dispatched += 1,
                InboxStatus::Dead => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl InboxStore for MemoryInboxStore {
    async fn observe(&self, message: ObservedMessage) -> Result<ObserveOutcome> {
        ensure_message_id(&message.message_id)?;
        let now = Utc::now();
        let mut rows = self.lock();
        if let Some(row) = rows.get_mut(&message.message_id) {
            row.last_seen_at = now;
            return Ok(ObserveOutcome::Duplicate);
        }
        rows.insert(
            message.message_id.clone(),
            InboxRecord {
                message_id: message.message_id,
                source: message.source,
                hash: message.hash,
                first_seen_at: now,
                last_seen_at: now,
                processed_at: None,
                due_time: message.due_time,
                status: InboxStatus::Seen,
                attempts: 0,
                last_error: None,
                locked_until: None,
                owner_token: None,
                topic: message.topic,
                payload: message.payload,
            },
        );
        Ok(ObserveOutcome::Accepted)
    }

    async fn get(&self, message_id: &str) -> Result<Option<InboxRecord>> {
        Ok(self.lock().get(message_id).cloned())
    }
}

// =============================================================================
// Timers
// =============================================================================

/// In-memory [`TimerStore`].
#[derive(Default)]
pub struct MemoryTimerStore {
    inner: Mutex<HashMap<Uuid, TimerRecord>>,
}

impl MemoryTimerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, TimerRecord>> {
        self.inner.lock().expect("timer lock poisoned")
    }
}

#[async_trait]
impl MessageQueue for MemoryTimerStore {
    type Id = Uuid;

    fn queue_name(&self) -> &'static str {
        "timers"
    }

    async fn claim(
        &self,
        owner: OwnerToken,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedMessage<Uuid>>> {
        ensure_batch_size(batch_size)?;
        let now = Utc::now();
        let mut rows = self.lock();

        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = rows
            .values()
            .filter(|row| {
                row.status == MessageStatus::Pending
                    && row.due_time <= now
                    && row.locked_until.map_or(true, |until| until <= now)
            })
            .map(|row| (row.due_time, row.id))
            .collect();
        candidates.sort();
        candidates.truncate(batch_size);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(row) = rows.get_mut(&id) {
                row.status = MessageStatus::Processing;
                row.owner_token = Some(owner);
                row.locked_until = Some(now + to_chrono(lease));
                claimed.push(ClaimedMessage {
                    id: row.id,
                    topic: row.topic.clone(),
                    payload: row.payload.clone(),
                    dedup_id: Some(row.id.to_string()),
                    correlation_id: row.correlation_id.clone(),
                    attempt: row.attempt_count,
                });
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, owner: OwnerToken, ids: &[Uuid]) -> Result<()> {
        let now = Utc::now();
        let mut rows = self.lock();
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                if row.status == MessageStatus::Processing && row.owner_token == Some(owner) {
                    row.status = MessageStatus::Dispatched;
                    row.processed_at = Some(now);
                    row.owner_token = None;
                    row.locked_until = None;
                }
            }
        }
        Ok(())
    }

    async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[Uuid],
        last_error: Option<&str>,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut rows = self.lock();
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                if row.status == MessageStatus::Processing && row.owner_token == Some(owner) {
                    row.status = MessageStatus::Pending;
                    row.attempt_count += 1;
                    row.owner_token = None;
                    row.locked_until = None;
                    if let Some(error) = last_error {
                        row.last_error = Some(error.to_string());
                    }
                    if let Some(retry_at) = retry_at {
                        row.due_time = retry_at;
                    }
                }
            }
        }
        Ok(())
    }

    async fn fail(&self, owner: OwnerToken, ids: &[Uuid], reason: Option<&str>) -> Result<()> {
        let now = Utc::now();
        let mut rows = self.lock();
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                if row.status == MessageStatus::Processing && row.owner_token == Some(owner) {
                    row.status = MessageStatus::Failed;
                    row.processed_at = Some(now);
                    row.owner_token = None;
                    row.locked_until = None;
                    if let Some(reason) = reason {
                        row.last_error = Some(reason.to_string());
                    }
                }
            }
        }
        Ok(())
    }

    async fn extend_lease(
        &self,
        owner: OwnerToken,
        ids: &[Uuid],
        lease: Duration,
    ) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let mut rows = self.lock();
        let mut extended = Vec::new();
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                if row.status == MessageStatus::Processing && row.owner_token == Some(owner) {
                    row.locked_until = Some(now + to_chrono(lease));
                    extended.push(*id);
                }
            }
        }
        Ok(extended)
    }

    async fn reap_expired(&self, limit: usize) -> Result<u64> {
        let now = Utc::now();
        let mut rows = self.lock();
        let expired: Vec<Uuid> = rows
            .values()
            .filter(|row| {
                row.status == MessageStatus::Processing
                    && row.locked_until.map_or(false, |until| until <= now)
            })
            .map(|row| row.id)
            .take(limit)
            .collect();
        for id in &expired {
            if let Some(row) = rows.get_mut(id) {
                row.status = MessageStatus::Pending;
                row.owner_token = None;
                row.locked_until = None;
            }
        }
        Ok(expired.len() as u64)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>, limit: usize) -> Result<u64> {
        let mut rows = self.lock();
        let purgeable: Vec<Uuid> = rows
            .values()
            .filter(|row| {
                row.status.is_terminal() && row.processed_at.map_or(false, |at| at < older_than)
            })
            .map(|row| row.id)
            .take(limit)
            .collect();
        for id in &purgeable {
            rows.remove(id);
        }
        Ok(purgeable.len() as u64)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows = self.lock();
        let mut stats = QueueStats::default();
        for row in rows.values() {
            match row.status {
                MessageStatus::Pending => stats.pending += 1,
                MessageStatus::Processing => stats.processing += 1,
                MessageStatus::Dispatched => stats.dispatched += 1,
                MessageStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl TimerStore for MemoryTimerStore {
    async fn schedule_timer(&self, timer: NewTimer) -> Result<Uuid> {
        ensure_name(&timer.topic)?;
        let id = Uuid::new_v4();
        self.lock().insert(
            id,
            TimerRecord {
                id,
                topic: timer.topic,
                payload: timer.payload,
                correlation_id: timer.correlation_id,
                created_at: Utc::now(),
                due_time: timer.due_time,
                status: MessageStatus::Pending,
                locked_until: None,
                owner_token: None,
                attempt_count: 0,
                last_error: None,
                processed_at: None,
            },
        );
        Ok(id)
    }

    async fn cancel_timer(&self, id: Uuid) -> Result<bool> {
        let mut rows = self.lock();
        let cancellable = matches!(
            rows.get(&id),
            Some(row) if row.status == MessageStatus::Pending
        );
        if cancellable {
            rows.remove(&id);
        }
        Ok(cancellable)
    }

    async fn get_timer(&self, id: Uuid) -> Result<Option<TimerRecord>> {
        Ok(self.lock().get(&id).cloned())
    }
}

// =============================================================================
// Cron jobs and runs
// =============================================================================

struct RunRow {
    record: JobRunRecord,
}

#[derive(Default)]
struct CronInner {
    jobs: HashMap<String, JobDefinition>,
    runs: HashMap<Uuid, RunRow>,
    planned_ticks: HashMap<String, Vec<DateTime<Utc>>>,
}

/// In-memory [`CronJobStore`].
#[derive(Default)]
pub struct MemoryCronJobStore {
    inner: Mutex<CronInner>,
}

impl MemoryCronJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test seam: rewinds a definition's `next_due` to simulate a schedule
    /// that fell behind.
    pub fn set_next_due(&self, name: &str, next_due: DateTime<Utc>) {
        if let Some(job) = self.lock().jobs.get_mut(name) {
            job.next_due = Some(next_due);
        }
    }

    fn lock(&self) -> MutexGuard<'_, CronInner> {
        self.inner.lock().expect("cron lock poisoned")
    }

    fn insert_run(
        inner: &mut CronInner,
        job: &JobDefinition,
        scheduled_time: DateTime<Utc>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        inner.runs.insert(
            id,
            RunRow {
                record: JobRunRecord {
                    id,
                    job_name: job.name.clone(),
                    scheduled_time,
                    topic: job.topic.clone(),
                    payload: job.payload.clone(),
                    status: MessageStatus::Pending,
                    locked_until: None,
                    owner_token: None,
                    attempt_count: 0,
                    last_error: None,
                    processed_at: None,
                    created_at: Utc::now(),
                },
            },
        );
        id
    }

    fn settle_job(inner: &mut CronInner, job_name: &str, status: &str, now: DateTime<Utc>) {
        if let Some(job) = inner.jobs.get_mut(job_name) {
            job.last_run_at = Some(now);
            job.last_status = Some(status.to_string());
        }
    }
}

#[async_trait]
impl MessageQueue for MemoryCronJobStore {
    type Id = Uuid;

    fn queue_name(&self) -> &'static str {
        "job-runs"
    }

    async fn claim(
        &self,
        owner: OwnerToken,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedMessage<Uuid>>> {
        ensure_batch_size(batch_size)?;
        let now = Utc::now();
        let mut inner = self.lock();

        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = inner
            .runs
            .values()
            .filter(|run| {
                run.record.status == MessageStatus::Pending
                    && run.record.scheduled_time <= now
                    && run.record.locked_until.map_or(true, |until| until <= now)
            })
            .map(|run| (run.record.scheduled_time, run.record.id))
            .collect();
        candidates.sort();
        candidates.truncate(batch_size);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(run) = inner.runs.get_mut(&id) {
                run.record.status = MessageStatus::Processing;
                run.record.owner_token = Some(owner);
                run.record.locked_until = Some(now + to_chrono(lease));
                claimed.push(ClaimedMessage {
                    id,
                    topic: run.record.topic.clone(),
                    payload: run.record.payload.clone(),
                    dedup_id: Some(format!(
                        "{}:{}",
                        run.record.job_name,
                        run.record.scheduled_time.timestamp()
                    )),
                    correlation_id: None,
                    attempt: run.record.attempt_count,
                });
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, owner: OwnerToken, ids: &[Uuid]) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.lock();
        for id in ids {
            let job_name = match inner.runs.get_mut(id) {
                Some(run)
                    if run.record.status == MessageStatus::Processing
                        && run.record.owner_token == Some(owner) =>
                {
                    run.record.status = MessageStatus::Dispatched;
                    run.record.processed_at = Some(now);
                    run.record.owner_token = None;
                    run.record.locked_until = None;
                    Some(run.record.job_name.clone())
                }
                _ => None,
            };
            if let Some(job_name) = job_name {
                Self::settle_job(&mut inner, &job_name, "succeeded", now);
            }
        }
        Ok(())
    }

    async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[Uuid],
        last_error: Option<&str>,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.lock();
        for id in ids {
            if let Some(run) = inner.runs.get_mut(id) {
                if run.record.status == MessageStatus::Processing
                    && run.record.owner_token == Some(owner)
                {
                    run.record.status = MessageStatus::Pending;
                    run.record.attempt_count += 1;
                    run.record.owner_token = None;
                    run.record.locked_until = None;
                    if let Some(error) = last_error {
                        run.record.last_error = Some(error.to_string());
                    }
                    if let Some(retry_at) = retry_at {
                        run.record.scheduled_time = retry_at;
                    }
                }
            }
        }
        Ok(())
    }

    async fn fail(&self, owner: OwnerToken, ids: &[Uuid], reason: Option<&str>) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.lock();
        for id in ids {
            let job_name = match inner.runs.get_mut(id) {
                Some(run)
                    if run.record.status == MessageStatus::Processing
                        && run.record.owner_token == Some(owner) =>
                {
                    run.record.status = MessageStatus::Failed;
                    run.record.processed_at = Some(now);
                    run.record.owner_token = None;
                    run.record.locked_until = None;
                    if let Some(reason) = reason {
                        run.record.last_error = Some(reason.to_string());
                    }
                    Some(run.record.job_name.clone())
                }
                _ => None,
            };
            if let Some(job_name) = job_name {
                Self::settle_job(&mut inner, &job_name, "failed", now);
            }
        }
        Ok(())
    }

    async fn extend_lease(
        &self,
        owner: OwnerToken,
        ids: &[Uuid],
        lease: Duration,
    ) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let mut inner = self.lock();
        let mut extended = Vec::new();
        for id in ids {
            if let Some(run) = inner.runs.get_mut(id) {
                if run.record.status == MessageStatus::Processing
                    && run.record.owner_token == Some(owner)
                {
                    run.record.locked_until = Some(now + to_chrono(lease));
                    extended.push(*id);
                }
            }
        }
        Ok(extended)
    }

    async fn reap_expired(&self, limit: usize) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.lock();
        let expired: Vec<Uuid> = inner
            .runs
            .values()
            .filter(|run| {
                run.record.status == MessageStatus::Processing
                    && run.record.locked_until.map_or(false, |until| until <= now)
            })
            .map(|run| run.record.id)
            .take(limit)
            .collect();
        for id in &expired {
            if let Some(run) = inner.runs.get_mut(id) {
                run.record.status = MessageStatus::Pending;
                run.record.owner_token = None;
                run.record.locked_until = None;
            }
        }
        Ok(expired.len() as u64)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>, limit: usize) -> Result<u64> {
        let mut inner = self.lock();
        let purgeable: Vec<Uuid> = inner
            .runs
            .values()
            .filter(|run| {
                run.record.status.is_terminal()
                    && run.record.processed_at.map_or(false, |at| at < older_than)
            })
            .map(|run| run.record.id)
            .take(limit)
            .collect();
        for id in &purgeable {
            inner.runs.remove(id);
        }
        Ok(purgeable.len() as u64)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let inner = self.lock();
        let mut stats = QueueStats::default();
        for run in inner.runs.values() {
            match run.record.status {
                MessageStatus::Pending => stats.pending += 1,
                MessageStatus::Processing => stats.processing += 1,
                MessageStatus::Dispatched => stats.dispatched += 1,
                MessageStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl CronJobStore for MemoryCronJobStore {
    async fn upsert_job(&self, spec: JobSpec) -> Result<()> {
        ensure_name(&spec.name)?;
        ensure_name(&spec.topic)?;
        let schedule = cron::parse(&spec.cron)?;
        let next_due = cron::next_after(&schedule, Utc::now());

        let mut inner = self.lock();
        let previous = inner.jobs.get(&spec.name);
        let (last_run_at, last_status) = previous
            .map(|job| (job.last_run_at, job.last_status.clone()))
            .unwrap_or((None, None));
        inner.jobs.insert(
            spec.name.clone(),
            JobDefinition {
                name: spec.name,
                cron: spec.cron,
                topic: spec.topic,
                payload: spec.payload,
                enabled: spec.enabled,
                next_due,
                last_run_at,
                last_status,
            },
        );
        Ok(())
    }

    async fn set_job_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(name) else {
            return Ok(false);
        };
        job.enabled = enabled;
        if enabled {
            if let Ok(schedule) = cron::parse(&job.cron) {
                job.next_due = cron::next_after(&schedule, Utc::now());
            }
        }
        Ok(true)
    }

    async fn trigger_job(&self, name: &str) -> Result<Uuid> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get(name).cloned() else {
            return Err(CoordinationError::UnknownJob {
                name: name.to_string(),
            }
            .into());
        };
        Ok(Self::insert_run(&mut inner, &job, Utc::now()))
    }

    async fn get_job(&self, name: &str) -> Result<Option<JobDefinition>> {
        Ok(self.lock().jobs.get(name).cloned())
    }

    async fn plan_due_jobs(&self, batch: usize, policy: CatchUpPolicy) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.lock();

        let mut due: Vec<(DateTime<Utc>, String)> = inner
            .jobs
            .values()
            .filter(|job| job.enabled && job.next_due.map_or(false, |next| next <= now))
            .filter_map(|job| job.next_due.map(|next| (next, job.name.clone())))
            .collect();
        due.sort();
        due.truncate(batch);

        let mut materialized = 0;
        for (next_due, name) in due {
            let Some(job) = inner.jobs.get(&name).cloned() else {
                continue;
            };
            let schedule = match cron::parse(&job.cron) {
                Ok(schedule) => schedule,
                Err(_) => continue,
            };
            let step = cron::plan(&schedule, next_due, now, policy);
            if let Some(run_at) = step.run_at {
                let already_planned = inner
                    .planned_ticks
                    .get(&name)
                    .is_some_and(|ticks| ticks.contains(&run_at));
                if !already_planned {
                    Self::insert_run(&mut inner, &job, run_at);
                    inner.planned_ticks.entry(name.clone()).or_default().push(run_at);
                    materialized += 1;
                }
            }
            if let Some(job) = inner.jobs.get_mut(&name) {
                job.next_due = step.next_due;
            }
        }
        Ok(materialized)
    }

    async fn list_runs(&self, name: &str) -> Result<Vec<JobRunRecord>> {
        let inner = self.lock();
        let mut runs: Vec<JobRunRecord> = inner
            .runs
            .values()
            .filter(|run| run.record.job_name == name)
            .map(|run| run.record.clone())
            .collect();
        runs.sort_by_key(|run| run.scheduled_time);
        Ok(runs)
    }
}

// =============================================================================
// Leases
// =============================================================================

/// In-memory [`LeaseStore`].
#[derive(Default)]
pub struct MemoryLeaseStore {
    inner: Mutex<HashMap<String, LeaseRecord>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LeaseRecord>> {
        self.inner.lock().expect("lease lock poisoned")
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn acquire(
        &self,
        name: &str,
        owner: OwnerToken,
        ttl: Duration,
        context: Option<Value>,
    ) -> Result<AcquireOutcome> {
        ensure_name(name)?;
        let now = Utc::now();
        let mut rows = self.lock();
        let row = rows.entry(name.to_string()).or_insert_with(|| LeaseRecord {
            resource_name: name.to_string(),
            owner_token: None,
            lease_until: None,
            fencing_token: 0,
            context: None,
        });

        let takeable = match (row.owner_token, row.lease_until) {
            (None, _) => true,
            (Some(holder), _) if holder == owner => true,
            (Some(_), Some(until)) => until <= now,
            (Some(_), None) => true,
        };
        if !takeable {
            return Ok(AcquireOutcome::Held);
        }

        row.owner_token = Some(owner);
        row.lease_until = Some(now + to_chrono(ttl));
        row.fencing_token += 1;
        if context.is_some() {
            row.context = context;
        }
        Ok(AcquireOutcome::Acquired {
            fencing_token: row.fencing_token,
        })
    }

    async fn renew(&self, name: &str, owner: OwnerToken, ttl: Duration) -> Result<RenewOutcome> {
        let now = Utc::now();
        let mut rows = self.lock();
        match rows.get_mut(name) {
            Some(row) if row.owner_token == Some(owner) => {
                row.lease_until = Some(now + to_chrono(ttl));
                row.fencing_token += 1;
                Ok(RenewOutcome::Renewed {
                    fencing_token: row.fencing_token,
                })
            }
            _ => Ok(RenewOutcome::Lost),
        }
    }

    async fn release(&self, name: &str, owner: OwnerToken) -> Result<bool> {
        let mut rows = self.lock();
        match rows.get_mut(name) {
            Some(row) if row.owner_token == Some(owner) => {
                row.owner_token = None;
                row.lease_until = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, name: &str) -> Result<Option<LeaseRecord>> {
        Ok(self.lock().get(name).cloned())
    }
}

// =============================================================================
// Semaphores
// =============================================================================

struct SemaphoreDef {
    limit: u32,
    next_fencing: i64,
}

struct SemaphoreLeaseRow {
    name: String,
    token: Uuid,
    fencing: i64,
    owner_id: String,
    lease_until: DateTime<Utc>,
    client_request_id: Option<String>,
}

#[derive(Default)]
struct SemaphoreInner {
    defs: HashMap<String, SemaphoreDef>,
    leases: Vec<SemaphoreLeaseRow>,
}

/// In-memory [`SemaphoreStore`]. Reaps up to five expired leases per
/// acquire, matching the Postgres store's amortized cleanup.
#[derive(Default)]
pub struct MemorySemaphoreStore {
    inner: Mutex<SemaphoreInner>,
}

const REAP_PER_ACQUIRE: usize = 5;

impl MemorySemaphoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SemaphoreInner> {
        self.inner.lock().expect("semaphore lock poisoned")
    }

    fn reap_some(inner: &mut SemaphoreInner, name: Option<&str>, max_rows: usize) -> u64 {
        let now = Utc::now();
        let mut removed = 0;
        inner.leases.retain(|lease| {
            let expired = lease.lease_until <= now && name.map_or(true, |n| lease.name == n);
            if expired && removed < max_rows {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed as u64
    }
}

#[async_trait]
impl SemaphoreStore for MemorySemaphoreStore {
    async fn register(&self, name: &str, limit: u32) -> Result<()> {
        ensure_name(name)?;
        let mut inner = self.lock();
        inner
            .defs
            .entry(name.to_string())
            .and_modify(|def| def.limit = limit)
            .or_insert(SemaphoreDef {
                limit,
                next_fencing: 1,
            });
        Ok(())
    }

    async fn try_acquire(
        &self,
        name: &str,
        ttl: Duration,
        owner_id: &str,
        client_request_id: Option<&str>,
    ) -> Result<TryAcquireOutcome> {
        let now = Utc::now();
        let mut inner = self.lock();
        let Some(limit) = inner.defs.get(name).map(|def| def.limit) else {
            return Ok(TryAcquireOutcome::NotAcquired);
        };

        // Idempotent retry: hand back the live lease for this request id.
        if let Some(request_id) = client_request_id {
            if let Some(existing) = inner.leases.iter().find(|lease| {
                lease.name == name
                    && lease.lease_until > now
                    && lease.client_request_id.as_deref() == Some(request_id)
            }) {
                return Ok(TryAcquireOutcome::Acquired(SemaphoreLease {
                    name: existing.name.clone(),
                    token: existing.token,
                    fencing_token: existing.fencing,
                    expires_at: existing.lease_until,
                }));
            }
        }

        Self::reap_some(&mut inner, Some(name), REAP_PER_ACQUIRE);

        let live = inner
            .leases
            .iter()
            .filter(|lease| lease.name == name && lease.lease_until > now)
            .count();
        if live as u32 >= limit {
            return Ok(TryAcquireOutcome::NotAcquired);
        }

        let fencing = {
            let def = inner
                .defs
                .get_mut(name)
                .ok_or_else(|| anyhow!("semaphore `{name}` disappeared"))?;
            let fencing = def.next_fencing;
            def.next_fencing += 1;
            fencing
        };

        let token = Uuid::new_v4();
        let expires_at = now + to_chrono(ttl);
        inner.leases.push(SemaphoreLeaseRow {
            name: name.to_string(),
            token,
            fencing,
            owner_id: owner_id.to_string(),
            lease_until: expires_at,
            client_request_id: client_request_id.map(str::to_string),
        });

        Ok(TryAcquireOutcome::Acquired(SemaphoreLease {
            name: name.to_string(),
            token,
            fencing_token: fencing,
            expires_at,
        }))
    }

    async fn renew(&self, name: &str, token: Uuid, ttl: Duration) -> Result<RenewalOutcome> {
        let now = Utc::now();
        let mut inner = self.lock();
        match inner
            .leases
            .iter_mut()
            .find(|lease| lease.name == name && lease.token == token)
        {
            Some(lease) if lease.lease_until > now => {
                lease.lease_until = now + to_chrono(ttl);
                Ok(RenewalOutcome::Renewed {
                    expires_at: lease.lease_until,
                })
            }
            _ => Ok(RenewalOutcome::Lost),
        }
    }

    async fn release(&self, name: &str, token: Uuid) -> Result<ReleaseOutcome> {
        let mut inner = self.lock();
        let before = inner.leases.len();
        inner
            .leases
            .retain(|lease| !(lease.name == name && lease.token == token));
        if inner.leases.len() < before {
            Ok(ReleaseOutcome::Released)
        } else {
            Ok(ReleaseOutcome::NotFound)
        }
    }

    async fn reap_expired(&self, name: Option<&str>, max_rows: usize) -> Result<u64> {
        let mut inner = self.lock();
        Ok(Self::reap_some(&mut inner, name, max_rows))
    }

    async fn live_count(&self, name: &str) -> Result<u64> {
        let now = Utc::now();
        let inner = self.lock();
        Ok(inner
            .leases
            .iter()
            .filter(|lease| lease.name == name && lease.lease_until > now)
            .count() as u64)
    }
}

// =============================================================================
// External side effects
// =============================================================================

#[derive(Default)]
struct EffectInner {
    rows: HashMap<(String, String), EffectRecord>,
    by_id: HashMap<Uuid, (String, String)>,
}

/// In-memory [`EffectStore`].
#[derive(Default)]
pub struct MemoryEffectStore {
    inner: Mutex<EffectInner>,
}

impl MemoryEffectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EffectInner> {
        self.inner.lock().expect("effect lock poisoned")
    }
}

#[async_trait]
impl EffectStore for MemoryEffectStore {
    async fn get_or_create(
        &self,
        key: &EffectKey,
        payload_hash: Option<&[u8]>,
    ) -> Result<EffectRecord> {
        let now = Utc::now();
        let map_key = (key.operation_name.clone(), key.idempotency_key.clone());
        let mut inner = self.lock();
        if let Some(existing) = inner.rows.get(&map_key) {
            return Ok(existing.clone());
        }
        let record = EffectRecord {
            id: Uuid::new_v4(),
            operation_name: key.operation_name.clone(),
            idempotency_key: key.idempotency_key.clone(),
            status: EffectStatus::Pending,
            attempt_count: 0,
            created_at: now,
            last_updated_at: now,
            last_attempt_at: None,
            last_external_check_at: None,
            locked_until: None,
            locked_by: None,
            external_reference_id: None,
            external_status: None,
            last_error: None,
            payload_hash: payload_hash.map(<[u8]>::to_vec),
        };
        inner.by_id.insert(record.id, map_key.clone());
        inner.rows.insert(map_key, record.clone());
        Ok(record)
    }

    async fn try_begin_attempt(
        &self,
        id: Uuid,
        worker: &str,
        lock_duration: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.lock();
        let Some(map_key) = inner.by_id.get(&id).cloned() else {
            return Ok(false);
        };
        let Some(record) = inner.rows.get_mut(&map_key) else {
            return Ok(false);
        };
        let lockable = record.status == EffectStatus::Pending
            && record.locked_until.map_or(true, |until| until <= now);
        if !lockable {
            return Ok(false);
        }
        record.locked_until = Some(now + to_chrono(lock_duration));
        record.locked_by = Some(worker.to_string());
        record.attempt_count += 1;
        record.last_attempt_at = Some(now);
        record.last_updated_at = now;
        Ok(true)
    }

    async fn mark_succeeded(&self, id: Uuid, success: &EffectSuccess) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.lock();
        let Some(map_key) = inner.by_id.get(&id).cloned() else {
            return Ok(());
        };
        if let Some(record) = inner.rows.get_mut(&map_key) {
            record.status = EffectStatus::Succeeded;
            record.external_reference_id = success.external_reference_id.clone();
            record.external_status = success.external_status.clone();
            record.locked_until = None;
            record.locked_by = None;
            record.last_updated_at = now;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str, kind: FailureKind) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.lock();
        let Some(map_key) = inner.by_id.get(&id).cloned() else {
            return Ok(());
        };
        if let Some(record) = inner.rows.get_mut(&map_key) {
            if kind == FailureKind::Permanent {
                record.status = EffectStatus::Failed;
            }
            record.last_error = Some(error.to_string());
            record.locked_until = None;
            record.locked_by = None;
            record.last_updated_at = now;
        }
        Ok(())
    }

    async fn record_check(&self, id: Uuid) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.lock();
        let Some(map_key) = inner.by_id.get(&id).cloned() else {
            return Ok(());
        };
        if let Some(record) = inner.rows.get_mut(&map_key) {
            record.last_external_check_at = Some(now);
            record.last_updated_at = now;
        }
        Ok(())
    }

    async fn get(&self, key: &EffectKey) -> Result<Option<EffectRecord>> {
        let map_key = (key.operation_name.clone(), key.idempotency_key.clone());
        Ok(self.lock().rows.get(&map_key).cloned())
    }
}
