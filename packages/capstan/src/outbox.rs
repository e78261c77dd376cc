//! Transactional outbox: messages produced alongside business state,
//! dispatched asynchronously with at-least-once delivery.
//!
//! Producers enqueue in the same database transaction as their business
//! writes, so a message becomes visible iff the business state commits
//! (storage backends expose a connection-scoped enqueue for exactly this).
//! A dispatcher loop claims Pending rows through the work-queue protocol,
//! invokes the handler registered for the row's topic, and settles the row.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::join::JoinEnqueued;
use crate::workqueue::{MessageQueue, MessageStatus, OwnerToken};

/// A message to enqueue.
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    /// Dispatch routing key.
    pub topic: String,
    pub payload: Value,
    /// Stable producer-supplied id for downstream dedup. Generated when
    /// absent. Enqueueing the same `message_id` twice is a duplicate, not an
    /// error.
    pub message_id: Option<Uuid>,
    pub correlation_id: Option<String>,
    /// Earliest dispatch time; `None` means immediately claimable.
    pub due_time: Option<DateTime<Utc>>,
}

impl NewOutboxMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            message_id: None,
            correlation_id: None,
            due_time: None,
        }
    }

    pub fn with_message_id(mut self, message_id: Uuid) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_due_time(mut self, due_time: DateTime<Utc>) -> Self {
        self.due_time = Some(due_time);
        self
    }
}

/// Result of an enqueue that may hit message-id dedup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new row was created.
    Created(Uuid),
    /// A row with the same `message_id` already exists.
    Duplicate(Uuid),
}

impl EnqueueOutcome {
    /// The row id regardless of dedup outcome.
    pub fn id(&self) -> Uuid {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueOutcome::Created(_))
    }
}

/// A full outbox row, for inspection and tests.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub topic: String,
    pub payload: Value,
    pub message_id: Uuid,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub due_time: Option<DateTime<Utc>>,
    pub status: MessageStatus,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner_token: Option<OwnerToken>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Set when the row is a member (or the held parent) of a fan-in join.
    pub join_id: Option<Uuid>,
}

/// The outbox store: enqueue plus the shared work-queue protocol.
///
/// Backends additionally expose a connection-scoped enqueue so producers can
/// ride their own transaction; that method is inherent to the backend type
/// because its connection handle is backend-specific.
#[async_trait]
pub trait OutboxStore: MessageQueue<Id = Uuid> {
    /// Enqueues one message. Dedups on `message_id`.
    async fn enqueue(&self, message: NewOutboxMessage) -> Result<EnqueueOutcome>;

    /// Enqueues a fan-in barrier: `children` are dispatched immediately, and
    /// `parent` is held back until `expected_steps` of them settle (the
    /// configured fire policy decides how failures count). The parent's
    /// dispatch is the completion signal.
    async fn enqueue_join(
        &self,
        parent: NewOutboxMessage,
        children: Vec<NewOutboxMessage>,
        expected_steps: u32,
    ) -> Result<JoinEnqueued>;

    /// Fetches one row by id.
    async fn get(&self, id: Uuid) -> Result<Option<OutboxRecord>>;
}
