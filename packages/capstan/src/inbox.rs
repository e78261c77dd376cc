//! Deduplicated inbox for externally observed messages.
//!
//! `observe` is idempotent on the producer-supplied `message_id`: the first
//! sighting creates a row in Seen state, later sightings only touch
//! `last_seen_at`. Rows that carry a topic are claimable through the
//! work-queue protocol, which guarantees a handler runs at most once to
//! completion per message id; rows without a topic are dedup records only
//! and never claimed.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::CoordinationError;
use crate::workqueue::{InboxStatus, MessageQueue, OwnerToken};

/// Upper bound on producer-supplied message ids.
pub const MAX_MESSAGE_ID_LEN: usize = 64;

/// Validates an inbox message id: non-empty, at most 64 characters.
pub fn ensure_message_id(message_id: &str) -> Result<(), CoordinationError> {
    if message_id.is_empty() {
        return Err(CoordinationError::InvalidName {
            reason: "message id must not be empty".to_string(),
        });
    }
    let length = message_id.chars().count();
    if length > MAX_MESSAGE_ID_LEN {
        return Err(CoordinationError::MessageIdTooLong {
            got: length,
            max: MAX_MESSAGE_ID_LEN,
        });
    }
    Ok(())
}

/// An externally observed message.
#[derive(Debug, Clone)]
pub struct ObservedMessage {
    /// Producer-supplied id; the dedup key.
    pub message_id: String,
    /// Origin identifier (queue name, webhook source, partner system).
    pub source: String,
    /// Dispatch topic. `None` makes the row a dedup record that is never
    /// claimed.
    pub topic: Option<String>,
    pub payload: Option<Value>,
    /// Optional 32-byte payload fingerprint for dedup verification.
    pub hash: Option<Vec<u8>>,
    pub due_time: Option<DateTime<Utc>>,
}

impl ObservedMessage {
    pub fn new(message_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            source: source.into(),
            topic: None,
            payload: None,
            hash: None,
            due_time: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_hash(mut self, hash: Vec<u8>) -> Self {
        self.hash = Some(hash);
        self
    }

    pub fn with_due_time(mut self, due_time: DateTime<Utc>) -> Self {
        self.due_time = Some(due_time);
        self
    }
}

/// Result of an observe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// First sighting; a row was created.
    Accepted,
    /// The message id was already on file; only `last_seen_at` moved.
    Duplicate,
}

/// A full inbox row, for inspection and tests.
#[derive(Debug, Clone)]
pub struct InboxRecord {
    pub message_id: String,
    pub source: String,
    pub hash: Option<Vec<u8>>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub due_time: Option<DateTime<Utc>>,
    pub status: InboxStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner_token: Option<OwnerToken>,
    pub topic: Option<String>,
    pub payload: Option<Value>,
}

/// The inbox store: idempotent observe plus the shared work-queue protocol
/// (Seen ⇄ Processing → {Done | Dead}).
#[async_trait]
pub trait InboxStore: MessageQueue<Id = String> {
    /// Records a sighting. Idempotent per `message_id`.
    async fn observe(&self, message: ObservedMessage) -> Result<ObserveOutcome>;

    /// Fetches one row by message id.
    async fn get(&self, message_id: &str) -> Result<Option<InboxRecord>>;
}
