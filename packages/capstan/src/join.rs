//! Fan-in barriers over related outbox messages.
//!
//! A join declares a set of member outbox messages and an expected step
//! count. Member settlement (ack or fail) runs join bookkeeping inside the
//! same transaction as the settlement itself: the member row transitions at
//! most once, each newly transitioned member bumps exactly one join counter,
//! and counters never exceed `expected_steps`. When the barrier fires, the
//! held parent outbox message is released (its due time set to now), so the
//! completion signal is an ordinary outbox dispatch.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Decides when the barrier fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinFirePolicy {
    /// Fire once `completed_steps + failed_steps == expected_steps`.
    #[default]
    AllSettled,
    /// Fire on the first failed member (the join goes terminal Failed and
    /// counters stop; remaining members still settle individually).
    EarlyOnFailure,
}

/// Join row status. Persisted as fixed integer codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Pending,
    /// Fired with no failed members counted.
    Completed,
    /// Fired with at least one failed member counted.
    Failed,
}

impl JoinStatus {
    pub fn code(self) -> i16 {
        match self {
            JoinStatus::Pending => 0,
            JoinStatus::Completed => 1,
            JoinStatus::Failed => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(JoinStatus::Pending),
            1 => Some(JoinStatus::Completed),
            2 => Some(JoinStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JoinStatus::Pending)
    }
}

/// Terminal status for a join given its final counters.
pub fn terminal_status(failed_steps: u32) -> JoinStatus {
    if failed_steps == 0 {
        JoinStatus::Completed
    } else {
        JoinStatus::Failed
    }
}

/// Sentinel due time that keeps the held parent message unclaimable until
/// the barrier fires.
pub fn hold_due_time() -> DateTime<Utc> {
    // Far enough that no claim predicate ever matches it.
    Utc.with_ymd_and_hms(9999, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Result of `enqueue_join`.
#[derive(Debug, Clone)]
pub struct JoinEnqueued {
    /// The held parent outbox row.
    pub parent_id: Uuid,
    pub join_id: Uuid,
    /// Member outbox rows, in the order they were supplied.
    pub child_ids: Vec<Uuid>,
}

/// A join row, for inspection and tests.
#[derive(Debug, Clone)]
pub struct JoinRecord {
    pub join_id: Uuid,
    /// Application grouping key (the parent's correlation id, falling back
    /// to its topic).
    pub owner_key: String,
    pub expected_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub status: JoinStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub metadata: Option<Value>,
    pub parent_outbox_id: Uuid,
}

/// A join member row.
#[derive(Debug, Clone)]
pub struct JoinMemberRecord {
    pub join_id: Uuid,
    pub outbox_message_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Read access to joins, for inspection and tests. Bookkeeping writes are
/// not exposed here; they happen inside outbox ack/fail transactions.
#[async_trait]
pub trait JoinStore: Send + Sync {
    async fn get_join(&self, join_id: Uuid) -> Result<Option<JoinRecord>>;

    async fn join_members(&self, join_id: Uuid) -> Result<Vec<JoinMemberRecord>>;
}
