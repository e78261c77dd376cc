//! The claim/ack/abandon/fail/reap protocol shared by every message store.
//!
//! All durable work in this crate flows through the same row-level state
//! machine: `Pending ⇄ Processing → {Dispatched | Failed}`. A claim moves a
//! row to Processing under a lease (`locked_until`) and an unguessable
//! [`OwnerToken`]; every later transition is guarded by that token, so a
//! worker whose lease expired cannot mutate a row another worker has since
//! re-claimed; its acks are silent no-ops. A reaper returns orphaned
//! Processing rows to Pending once their lease elapses.
//!
//! Implementations must make each transition atomic (conditional
//! `UPDATE ... WHERE (owner_token, status) = (...)` with a `RETURNING`
//! clause, or an equivalent) and must skip rows locked by another session
//! during claims so concurrent workers never serialize on each other.

use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Converts a wall-clock duration to a chrono delta, saturating instead of
/// failing on out-of-range values.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Unguessable per-claim identifier proving ownership of Processing rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerToken(Uuid);

impl OwnerToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for OwnerToken {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Row status for outbox messages, timers, and job runs.
///
/// Persisted as fixed integer codes so the wire format is stable across
/// releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Processing,
    Dispatched,
    Failed,
}

impl MessageStatus {
    pub fn code(self) -> i16 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Processing => 1,
            MessageStatus::Dispatched => 2,
            MessageStatus::Failed => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(MessageStatus::Pending),
            1 => Some(MessageStatus::Processing),
            2 => Some(MessageStatus::Dispatched),
            3 => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states are absorbing until retention deletes the row.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Dispatched | MessageStatus::Failed)
    }
}

/// Row status for inbox messages. Persisted as lowercase strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    Seen,
    Processing,
    Done,
    Dead,
}

impl InboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InboxStatus::Seen => "seen",
            InboxStatus::Processing => "processing",
            InboxStatus::Done => "done",
            InboxStatus::Dead => "dead",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "seen" => Some(InboxStatus::Seen),
            "processing" => Some(InboxStatus::Processing),
            "done" => Some(InboxStatus::Done),
            "dead" => Some(InboxStatus::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InboxStatus::Done | InboxStatus::Dead)
    }
}

impl fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row claimed for processing.
///
/// `attempt` counts completed prior attempts (abandons), so the first
/// delivery of a message sees `attempt == 0`.
#[derive(Debug, Clone)]
pub struct ClaimedMessage<Id> {
    pub id: Id,
    pub topic: String,
    pub payload: Value,
    /// Producer-supplied stable id for downstream dedup, where the store
    /// carries one.
    pub dedup_id: Option<String>,
    pub correlation_id: Option<String>,
    pub attempt: i32,
}

/// Per-status row counts for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub dispatched: i64,
    pub failed: i64,
}

/// The work-queue protocol over one conforming table.
///
/// The transport is `anyhow::Result`: an `Err` is a storage-level problem
/// (connection, timeout) with no row-level mutation implied. Ownership
/// violations are never errors; the guarded transitions simply match zero
/// rows.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Row identifier. Outbox/timers/job-runs key by `Uuid`; the inbox keys
    /// by the producer-supplied string id.
    type Id: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static;

    /// Short queue name for logs ("outbox", "inbox", "timers", "job-runs").
    fn queue_name(&self) -> &'static str;

    /// Claims up to `batch_size` due rows, moving each to Processing under
    /// `owner` with a lease of `lease`. Rows are returned in ordering-key
    /// order (due time, then creation time, then id); rows locked by another
    /// session are skipped rather than waited on.
    ///
    /// `batch_size == 0` is a precondition violation and fails before I/O.
    async fn claim(
        &self,
        owner: OwnerToken,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedMessage<Self::Id>>>;

    /// Processing → Dispatched/Done for rows still owned by `owner`.
    /// Sets `processed_at` and clears the lock columns. Non-owned ids are
    /// silently skipped.
    async fn ack(&self, owner: OwnerToken, ids: &[Self::Id]) -> Result<()>;

    /// Processing → Pending for rows still owned by `owner`, incrementing
    /// the attempt count and optionally rescheduling to `retry_at`.
    async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[Self::Id],
        last_error: Option<&str>,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Processing → terminal Failed/Dead for rows still owned by `owner`.
    async fn fail(&self, owner: OwnerToken, ids: &[Self::Id], reason: Option<&str>) -> Result<()>;

    /// Heartbeat: pushes `locked_until` forward for rows still owned by
    /// `owner` and returns the ids that were actually extended. An id
    /// missing from the result means the lease was lost.
    async fn extend_lease(
        &self,
        owner: OwnerToken,
        ids: &[Self::Id],
        lease: Duration,
    ) -> Result<Vec<Self::Id>>;

    /// Returns expired Processing rows (lease elapsed) to the claimable
    /// state. Driven by an independent reaper loop; returns the number of
    /// rows recovered.
    async fn reap_expired(&self, limit: usize) -> Result<u64>;

    /// Deletes terminal rows whose `processed_at` is older than the cutoff.
    /// Returns the number of rows deleted.
    async fn purge_terminal(&self, older_than: DateTime<Utc>, limit: usize) -> Result<u64>;

    /// Per-status row counts, for operational visibility.
    async fn stats(&self) -> Result<QueueStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_status_codes_are_stable() {
        assert_eq!(MessageStatus::Pending.code(), 0);
        assert_eq!(MessageStatus::Processing.code(), 1);
        assert_eq!(MessageStatus::Dispatched.code(), 2);
        assert_eq!(MessageStatus::Failed.code(), 3);
        for code in 0..=3 {
            let status = MessageStatus::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert!(MessageStatus::from_code(4).is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!MessageStatus::Pending.is_terminal());
        assert!(!MessageStatus::Processing.is_terminal());
        assert!(MessageStatus::Dispatched.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
    }

    #[test]
    fn inbox_status_round_trips() {
        for status in [
            InboxStatus::Seen,
            InboxStatus::Processing,
            InboxStatus::Done,
            InboxStatus::Dead,
        ] {
            assert_eq!(InboxStatus::from_str(status.as_str()), Some(status));
        }
        assert!(InboxStatus::from_str("unknown").is_none());
        assert!(InboxStatus::Done.is_terminal());
        assert!(!InboxStatus::Seen.is_terminal());
    }

    #[test]
    fn owner_tokens_are_distinct() {
        assert_ne!(OwnerToken::generate(), OwnerToken::generate());
    }
}
