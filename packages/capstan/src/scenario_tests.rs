//! End-to-end coordination scenarios over the in-memory stores.
//!
//! These exercise the cross-module contracts: claim exclusivity, owner
//! guards, reap/reclaim, join counters, fencing monotonicity, semaphore
//! limits, scheduler catch-up, the side-effect envelope, and the dispatcher
//! loop itself.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::cron::CatchUpPolicy;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::effect::{
    CheckOutcome, EffectConfig, EffectKey, EffectOutcome, EffectStatus, EffectStore, EffectSuccess,
    SideEffects, UnknownCheckBehavior,
};
use crate::error::HandlerFailure;
use crate::handler::{handler_fn, HandlerRegistry};
use crate::inbox::{InboxStore, ObserveOutcome, ObservedMessage};
use crate::join::{JoinFirePolicy, JoinStatus, JoinStore};
use crate::lease::{AcquireOutcome, LeaseKeeper, LeaseStore, RenewOutcome};
use crate::outbox::{EnqueueOutcome, NewOutboxMessage, OutboxStore};
use crate::scheduler::{CronJobStore, JobSpec, NewTimer, TimerStore};
use crate::semaphore::{
    ReleaseOutcome, RenewalOutcome, SemaphoreStore, TryAcquire, TryAcquireOutcome,
    SemaphoreManager,
};
use crate::service::Service;
use crate::testing::{
    MemoryCronJobStore, MemoryEffectStore, MemoryInboxStore, MemoryLeaseStore, MemoryOutboxStore,
    MemorySemaphoreStore, MemoryTimerStore,
};
use crate::workqueue::{InboxStatus, MessageQueue, MessageStatus, OwnerToken};

fn message(topic: &str) -> NewOutboxMessage {
    NewOutboxMessage::new(topic, json!({}))
}

// -----------------------------------------------------------------------------
// Outbox: claim exclusivity, owner guards, reap
// -----------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_claims_hand_each_row_to_one_worker() {
    let store = Arc::new(MemoryOutboxStore::new());
    let id = store.enqueue(message("x")).await.unwrap().id();

    let (left, right) = tokio::join!(
        store.claim(OwnerToken::generate(), 10, Duration::from_secs(10)),
        store.claim(OwnerToken::generate(), 10, Duration::from_secs(10)),
    );
    let left = left.unwrap();
    let right = right.unwrap();

    assert_eq!(left.len() + right.len(), 1);
    let winner = left.first().or(right.first()).unwrap();
    assert_eq!(winner.id, id);

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Processing);
    assert!(row.owner_token.is_some());
    assert!(row.locked_until.unwrap() > Utc::now());
}

#[tokio::test]
async fn ack_reaches_dispatched_exactly_once() {
    let store = MemoryOutboxStore::new();
    let before = Utc::now();
    let id = store.enqueue(message("x")).await.unwrap().id();

    let owner = OwnerToken::generate();
    let claimed = store.claim(owner, 10, Duration::from_secs(10)).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].attempt, 0);

    store.ack(owner, &[id]).await.unwrap();
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Dispatched);
    assert!(row.owner_token.is_none());
    assert!(row.locked_until.is_none());
    let processed_at = row.processed_at.unwrap();
    assert!(processed_at >= before && processed_at <= before + chrono::Duration::seconds(10));

    // Terminal state is absorbing.
    store.ack(owner, &[id]).await.unwrap();
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Dispatched);
}

#[tokio::test]
async fn transitions_from_non_owner_are_silent_noops() {
    let store = MemoryOutboxStore::new();
    let id = store.enqueue(message("x")).await.unwrap().id();

    let owner = OwnerToken::generate();
    let stranger = OwnerToken::generate();
    store.claim(owner, 1, Duration::from_secs(10)).await.unwrap();

    store.ack(stranger, &[id]).await.unwrap();
    store.abandon(stranger, &[id], Some("nope"), None).await.unwrap();
    store.fail(stranger, &[id], Some("nope")).await.unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Processing);
    assert_eq!(row.owner_token, Some(owner));
    assert_eq!(row.attempt_count, 0);
    assert!(row.last_error.is_none());
}

#[tokio::test]
async fn abandon_increments_attempt_and_reschedules() {
    let store = MemoryOutboxStore::new();
    let id = store.enqueue(message("x")).await.unwrap().id();

    let owner = OwnerToken::generate();
    store.claim(owner, 1, Duration::from_secs(10)).await.unwrap();
    let retry_at = Utc::now() + chrono::Duration::seconds(30);
    store
        .abandon(owner, &[id], Some("downstream 503"), Some(retry_at))
        .await
        .unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Pending);
    assert_eq!(row.attempt_count, 1);
    assert_eq!(row.due_time, Some(retry_at));
    assert_eq!(row.last_error.as_deref(), Some("downstream 503"));

    // Not yet due again.
    let claimed = store.claim(owner, 10, Duration::from_secs(10)).await.unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn reap_recovers_expired_claims_and_late_acks_are_ignored() {
    let store = MemoryOutboxStore::new();
    let id = store.enqueue(message("x")).await.unwrap().id();

    let slow = OwnerToken::generate();
    let claimed = store.claim(slow, 1, Duration::from_millis(80)).await.unwrap();
    assert_eq!(claimed.len(), 1);

    tokio::time::sleep(Duration::from_millis(160)).await;
    assert_eq!(store.reap_expired(100).await.unwrap(), 1);

    let fast = OwnerToken::generate();
    let reclaimed = store.claim(fast, 1, Duration::from_secs(10)).await.unwrap();
    assert_eq!(reclaimed.len(), 1);

    // The evicted worker's ack must not touch the row.
    store.ack(slow, &[id]).await.unwrap();
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Processing);
    assert_eq!(row.owner_token, Some(fast));

    store.ack(fast, &[id]).await.unwrap();
    assert_eq!(
        store.get(id).await.unwrap().unwrap().status,
        MessageStatus::Dispatched
    );
}

#[tokio::test]
async fn enqueue_dedups_on_message_id() {
    let store = MemoryOutboxStore::new();
    let message_id = Uuid::new_v4();
    let first = store
        .enqueue(message("x").with_message_id(message_id))
        .await
        .unwrap();
    let second = store
        .enqueue(message("x").with_message_id(message_id))
        .await
        .unwrap();

    assert!(first.is_created());
    assert_eq!(second, EnqueueOutcome::Duplicate(first.id()));
    assert_eq!(store.stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn batch_size_bounds_are_enforced() {
    let store = MemoryOutboxStore::new();
    store.enqueue(message("x")).await.unwrap();
    store.enqueue(message("x")).await.unwrap();

    let owner = OwnerToken::generate();
    assert!(store.claim(owner, 0, Duration::from_secs(1)).await.is_err());

    let one = store.claim(owner, 1, Duration::from_secs(1)).await.unwrap();
    assert_eq!(one.len(), 1);
}

#[tokio::test]
async fn past_due_time_is_claimable_immediately() {
    let store = MemoryOutboxStore::new();
    let id = store
        .enqueue(message("x").with_due_time(Utc::now() - chrono::Duration::hours(1)))
        .await
        .unwrap()
        .id();
    let claimed = store
        .claim(OwnerToken::generate(), 10, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
}

#[tokio::test]
async fn future_due_time_is_not_claimable() {
    let store = MemoryOutboxStore::new();
    store
        .enqueue(message("x").with_due_time(Utc::now() + chrono::Duration::hours(1)))
        .await
        .unwrap();
    let claimed = store
        .claim(OwnerToken::generate(), 10, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn purge_deletes_only_old_terminal_rows() {
    let store = MemoryOutboxStore::new();
    let done = store.enqueue(message("x")).await.unwrap().id();
    let pending = store.enqueue(message("x")).await.unwrap().id();

    let owner = OwnerToken::generate();
    store.claim(owner, 1, Duration::from_secs(10)).await.unwrap();
    store.ack(owner, &[done]).await.unwrap();

    // Window still open: nothing to purge.
    let cutoff = Utc::now() - chrono::Duration::hours(1);
    assert_eq!(store.purge_terminal(cutoff, 100).await.unwrap(), 0);

    // Window elapsed: the dispatched row goes, the pending row stays.
    let cutoff = Utc::now() + chrono::Duration::hours(1);
    assert_eq!(store.purge_terminal(cutoff, 100).await.unwrap(), 1);
    assert!(store.get(done).await.unwrap().is_none());
    assert!(store.get(pending).await.unwrap().is_some());
}

// -----------------------------------------------------------------------------
// Inbox
// -----------------------------------------------------------------------------

#[tokio::test]
async fn observe_is_idempotent_per_message_id() {
    let store = MemoryInboxStore::new();
    let observed = ObservedMessage::new("m1", "S")
        .with_topic("webhook.received")
        .with_payload(json!({"n": 1}));

    assert_eq!(store.observe(observed.clone()).await.unwrap(), ObserveOutcome::Accepted);
    assert_eq!(store.observe(observed.clone()).await.unwrap(), ObserveOutcome::Duplicate);
    assert_eq!(store.observe(observed).await.unwrap(), ObserveOutcome::Duplicate);

    let row = store.get("m1").await.unwrap().unwrap();
    assert_eq!(row.status, InboxStatus::Seen);
    assert!(row.last_seen_at >= row.first_seen_at);
    assert_eq!(store.stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn inbox_rows_run_a_single_processing_cycle() {
    let store = MemoryInboxStore::new();
    store
        .observe(ObservedMessage::new("m1", "S").with_topic("t").with_payload(json!({})))
        .await
        .unwrap();

    let owner = OwnerToken::generate();
    let claimed = store.claim(owner, 10, Duration::from_secs(10)).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, "m1");

    // A second observe mid-processing dedups and does not produce a second
    // claimable row.
    assert_eq!(
        store
            .observe(ObservedMessage::new("m1", "S").with_topic("t"))
            .await
            .unwrap(),
        ObserveOutcome::Duplicate
    );
    assert!(store
        .claim(OwnerToken::generate(), 10, Duration::from_secs(10))
        .await
        .unwrap()
        .is_empty());

    store.ack(owner, &[claimed[0].id.clone()]).await.unwrap();
    let row = store.get("m1").await.unwrap().unwrap();
    assert_eq!(row.status, InboxStatus::Done);
    assert!(row.processed_at.is_some());
}

#[tokio::test]
async fn inbox_rows_without_topic_are_dedup_records_only() {
    let store = MemoryInboxStore::new();
    store.observe(ObservedMessage::new("m1", "S")).await.unwrap();
    assert!(store
        .claim(OwnerToken::generate(), 10, Duration::from_secs(1))
        .await
        .unwrap()
        .is_empty());
}

// -----------------------------------------------------------------------------
// Leases
// -----------------------------------------------------------------------------

#[tokio::test]
async fn fencing_tokens_increase_across_holders() {
    let store = MemoryLeaseStore::new();
    let x = OwnerToken::generate();
    let y = OwnerToken::generate();
    let ttl = Duration::from_millis(300);

    assert_eq!(
        store.acquire("R", x, ttl, None).await.unwrap(),
        AcquireOutcome::Acquired { fencing_token: 1 }
    );
    // Re-entrant renewal bumps fencing.
    assert_eq!(
        store.acquire("R", x, ttl, None).await.unwrap(),
        AcquireOutcome::Acquired { fencing_token: 2 }
    );
    // Held by X: Y cannot take it.
    assert_eq!(store.acquire("R", y, ttl, None).await.unwrap(), AcquireOutcome::Held);

    // Lease expires; Y takes over with a higher token.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        store.acquire("R", y, Duration::from_secs(5), None).await.unwrap(),
        AcquireOutcome::Acquired { fencing_token: 3 }
    );
    // X is fenced out.
    assert_eq!(
        store.acquire("R", x, Duration::from_secs(5), None).await.unwrap(),
        AcquireOutcome::Held
    );
    assert_eq!(store.renew("R", x, Duration::from_secs(5)).await.unwrap(), RenewOutcome::Lost);

    let record = store.get("R").await.unwrap().unwrap();
    assert_eq!(record.fencing_token, 3);
    assert_eq!(record.owner_token, Some(y));
}

#[tokio::test]
async fn release_frees_the_lease_and_keeps_the_counter() {
    let store = MemoryLeaseStore::new();
    let x = OwnerToken::generate();
    let y = OwnerToken::generate();

    store.acquire("R", x, Duration::from_secs(5), None).await.unwrap();
    assert!(!store.release("R", y).await.unwrap());
    assert!(store.release("R", x).await.unwrap());

    assert_eq!(
        store.acquire("R", y, Duration::from_secs(5), None).await.unwrap(),
        AcquireOutcome::Acquired { fencing_token: 2 }
    );
}

#[tokio::test]
async fn lease_keeper_renews_until_loss() {
    let store = Arc::new(MemoryLeaseStore::new());
    let owner = OwnerToken::generate();
    let ttl = Duration::from_millis(120);
    store.acquire("R", owner, ttl, None).await.unwrap();

    let keeper = LeaseKeeper::spawn(Arc::clone(&store), "R", owner, ttl, 0.5);
    let lost = keeper.lost_token();

    // Several TTLs pass; the keeper holds the lease alive.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!lost.is_cancelled());
    let record = store.get("R").await.unwrap().unwrap();
    assert_eq!(record.owner_token, Some(owner));
    assert!(record.fencing_token > 1);

    // Simulate losing the lease out from under the keeper.
    store.release("R", owner).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(lost.is_cancelled());
    keeper.stop().await;
}

// -----------------------------------------------------------------------------
// Semaphores
// -----------------------------------------------------------------------------

#[tokio::test]
async fn semaphore_enforces_holder_limit() {
    let store = MemorySemaphoreStore::new();
    store.register("sem", 2).await.unwrap();
    let ttl = Duration::from_secs(30);

    let t1 = match store.try_acquire("sem", ttl, "o1", None).await.unwrap() {
        TryAcquireOutcome::Acquired(lease) => lease,
        other => panic!("expected acquire, got {other:?}"),
    };
    let t2 = match store.try_acquire("sem", ttl, "o2", None).await.unwrap() {
        TryAcquireOutcome::Acquired(lease) => lease,
        other => panic!("expected acquire, got {other:?}"),
    };
    assert_eq!(t1.fencing_token, 1);
    assert_eq!(t2.fencing_token, 2);

    assert_eq!(
        store.try_acquire("sem", ttl, "o3", None).await.unwrap(),
        TryAcquireOutcome::NotAcquired
    );

    assert_eq!(store.release("sem", t1.token).await.unwrap(), ReleaseOutcome::Released);
    let t3 = match store.try_acquire("sem", ttl, "o3", None).await.unwrap() {
        TryAcquireOutcome::Acquired(lease) => lease,
        other => panic!("expected acquire, got {other:?}"),
    };
    assert_eq!(t3.fencing_token, 3);
    assert_eq!(store.live_count("sem").await.unwrap(), 2);
}

#[tokio::test]
async fn semaphore_acquire_is_idempotent_per_client_request() {
    let store = MemorySemaphoreStore::new();
    store.register("sem", 1).await.unwrap();
    let ttl = Duration::from_secs(30);

    let first = match store.try_acquire("sem", ttl, "o1", Some("req-9")).await.unwrap() {
        TryAcquireOutcome::Acquired(lease) => lease,
        other => panic!("expected acquire, got {other:?}"),
    };
    let retry = match store.try_acquire("sem", ttl, "o1", Some("req-9")).await.unwrap() {
        TryAcquireOutcome::Acquired(lease) => lease,
        other => panic!("expected acquire, got {other:?}"),
    };
    assert_eq!(first.token, retry.token);
    assert_eq!(first.fencing_token, retry.fencing_token);
    assert_eq!(store.live_count("sem").await.unwrap(), 1);

    // A different request id competes normally.
    assert_eq!(
        store.try_acquire("sem", ttl, "o2", Some("req-10")).await.unwrap(),
        TryAcquireOutcome::NotAcquired
    );
}

#[tokio::test]
async fn expired_semaphore_leases_free_capacity_and_lose_renewal() {
    let store = MemorySemaphoreStore::new();
    store.register("sem", 1).await.unwrap();

    let lease = match store
        .try_acquire("sem", Duration::from_millis(80), "o1", None)
        .await
        .unwrap()
    {
        TryAcquireOutcome::Acquired(lease) => lease,
        other => panic!("expected acquire, got {other:?}"),
    };

    tokio::time::sleep(Duration::from_millis(160)).await;
    assert_eq!(
        store.renew("sem", lease.token, Duration::from_secs(5)).await.unwrap(),
        RenewalOutcome::Lost
    );

    // The expired holder no longer counts against the limit.
    assert!(matches!(
        store.try_acquire("sem", Duration::from_secs(5), "o2", None).await.unwrap(),
        TryAcquireOutcome::Acquired(_)
    ));
}

#[tokio::test]
async fn unregistered_semaphore_is_not_acquired() {
    let store = MemorySemaphoreStore::new();
    assert_eq!(
        store
            .try_acquire("ghost", Duration::from_secs(5), "o1", None)
            .await
            .unwrap(),
        TryAcquireOutcome::NotAcquired
    );
}

#[tokio::test]
async fn manager_validates_and_clamps() {
    let store = Arc::new(MemorySemaphoreStore::new());
    let manager = SemaphoreManager::new(Arc::clone(&store));
    manager.register("sem", 1).await.unwrap();
    assert!(manager.register("", 1).await.is_err());
    assert!(manager.register("sem", 0).await.is_err());

    // TTL below the minimum is clamped up, so the lease is still live after
    // a moment.
    let lease = match manager.try_acquire("sem", Duration::from_millis(1), "o1", None).await {
        TryAcquire::Acquired(lease) => lease,
        other => panic!("expected acquire, got {other:?}"),
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(lease.expires_at > Utc::now());
}

// -----------------------------------------------------------------------------
// Outbox joins
// -----------------------------------------------------------------------------

#[tokio::test]
async fn join_counts_settlements_and_releases_parent_once() {
    let store = MemoryOutboxStore::new();
    let enqueued = store
        .enqueue_join(
            message("batch.finished").with_correlation_id("batch-1"),
            vec![message("step"), message("step"), message("step")],
            3,
        )
        .await
        .unwrap();

    // The parent is held: children claim first.
    let owner = OwnerToken::generate();
    let claimed = store.claim(owner, 10, Duration::from_secs(10)).await.unwrap();
    let claimed_ids: Vec<Uuid> = claimed.iter().map(|m| m.id).collect();
    assert_eq!(claimed.len(), 3);
    assert!(!claimed_ids.contains(&enqueued.parent_id));

    let (a, b, c) = (
        enqueued.child_ids[0],
        enqueued.child_ids[1],
        enqueued.child_ids[2],
    );
    store.ack(owner, &[a]).await.unwrap();
    let join = store.get_join(enqueued.join_id).await.unwrap().unwrap();
    assert_eq!((join.completed_steps, join.failed_steps), (1, 0));
    assert_eq!(join.status, JoinStatus::Pending);

    store.ack(owner, &[b]).await.unwrap();
    store.fail(owner, &[c], Some("step exploded")).await.unwrap();

    let join = store.get_join(enqueued.join_id).await.unwrap().unwrap();
    assert_eq!(join.completed_steps + join.failed_steps, 3);
    assert_eq!((join.completed_steps, join.failed_steps), (2, 1));
    assert!(join.status.is_terminal());
    assert_eq!(join.status, JoinStatus::Failed);
    assert_eq!(join.owner_key, "batch-1");

    // The parent became claimable exactly once: the follow-up dispatch.
    let follow_up = store
        .claim(OwnerToken::generate(), 10, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(follow_up.len(), 1);
    assert_eq!(follow_up[0].id, enqueued.parent_id);
    assert_eq!(follow_up[0].topic, "batch.finished");
}

#[tokio::test]
async fn join_members_transition_at_most_once() {
    let store = MemoryOutboxStore::new();
    let enqueued = store
        .enqueue_join(message("done"), vec![message("step"), message("step")], 2)
        .await
        .unwrap();
    let owner = OwnerToken::generate();
    store.claim(owner, 10, Duration::from_secs(10)).await.unwrap();

    let first = enqueued.child_ids[0];
    store.ack(owner, &[first]).await.unwrap();
    // Terminal rows ignore further transitions, so the member cannot count
    // twice.
    store.ack(owner, &[first]).await.unwrap();
    store.fail(owner, &[first], None).await.unwrap();

    let join = store.get_join(enqueued.join_id).await.unwrap().unwrap();
    assert_eq!((join.completed_steps, join.failed_steps), (1, 0));

    let members = store.join_members(enqueued.join_id).await.unwrap();
    let member = members
        .iter()
        .find(|m| m.outbox_message_id == first)
        .unwrap();
    assert!(member.completed_at.is_some());
    assert!(member.failed_at.is_none());
}

#[tokio::test]
async fn early_fire_policy_releases_parent_on_first_failure() {
    let store = MemoryOutboxStore::with_fire_policy(JoinFirePolicy::EarlyOnFailure);
    let enqueued = store
        .enqueue_join(message("done"), vec![message("step"), message("step")], 2)
        .await
        .unwrap();
    let owner = OwnerToken::generate();
    store.claim(owner, 10, Duration::from_secs(10)).await.unwrap();

    store.fail(owner, &[enqueued.child_ids[0]], Some("boom")).await.unwrap();

    let join = store.get_join(enqueued.join_id).await.unwrap().unwrap();
    assert_eq!(join.status, JoinStatus::Failed);

    let follow_up = store
        .claim(OwnerToken::generate(), 10, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(follow_up.len(), 1);
    assert_eq!(follow_up[0].id, enqueued.parent_id);

    // The remaining member still settles, but counters are frozen.
    store.ack(owner, &[enqueued.child_ids[1]]).await.unwrap();
    let join = store.get_join(enqueued.join_id).await.unwrap().unwrap();
    assert_eq!((join.completed_steps, join.failed_steps), (0, 1));
}

#[tokio::test]
async fn join_rejects_unsatisfiable_expected_steps() {
    let store = MemoryOutboxStore::new();
    assert!(store
        .enqueue_join(message("done"), vec![message("step")], 2)
        .await
        .is_err());
    assert!(store
        .enqueue_join(message("done"), vec![message("step")], 0)
        .await
        .is_err());
}

// -----------------------------------------------------------------------------
// Scheduler
// -----------------------------------------------------------------------------

#[tokio::test]
async fn timers_fire_once_at_due_time() {
    let store = MemoryTimerStore::new();
    let due = store
        .schedule_timer(NewTimer::new("reminder", json!({}), Utc::now() - chrono::Duration::seconds(1)))
        .await
        .unwrap();
    let later = store
        .schedule_timer(NewTimer::new(
            "reminder",
            json!({}),
            Utc::now() + chrono::Duration::hours(1),
        ))
        .await
        .unwrap();

    let owner = OwnerToken::generate();
    let claimed = store.claim(owner, 10, Duration::from_secs(10)).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, due);

    store.ack(owner, &[due]).await.unwrap();
    assert_eq!(
        store.get_timer(due).await.unwrap().unwrap().status,
        MessageStatus::Dispatched
    );
    assert_eq!(
        store.get_timer(later).await.unwrap().unwrap().status,
        MessageStatus::Pending
    );
}

#[tokio::test]
async fn pending_timers_can_be_cancelled() {
    let store = MemoryTimerStore::new();
    let id = store
        .schedule_timer(NewTimer::new("t", json!({}), Utc::now() + chrono::Duration::hours(1)))
        .await
        .unwrap();
    assert!(store.cancel_timer(id).await.unwrap());
    assert!(!store.cancel_timer(id).await.unwrap());
    assert!(store.get_timer(id).await.unwrap().is_none());
}

#[tokio::test]
async fn catch_up_materializes_one_run_at_latest_boundary() {
    let store = MemoryCronJobStore::new();
    store
        .upsert_job(JobSpec::new("nightly", "0 */5 * * * *", "reports.run", json!({})))
        .await
        .unwrap();

    // The job fell an hour behind.
    let now = Utc::now();
    store.set_next_due("nightly", now - chrono::Duration::hours(1));

    let materialized = store.plan_due_jobs(10, CatchUpPolicy::FireOnce).await.unwrap();
    assert_eq!(materialized, 1);

    let runs = store.list_runs("nightly").await.unwrap();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    // One catch-up run at the most recent 5-minute boundary, no backlog.
    assert!(run.scheduled_time <= now);
    assert!(now - run.scheduled_time < chrono::Duration::minutes(5));
    assert_eq!(run.scheduled_time.timestamp() % 300, 0);

    let job = store.get_job("nightly").await.unwrap().unwrap();
    assert!(job.next_due.unwrap() > now);

    // Planning again materializes nothing further.
    assert_eq!(store.plan_due_jobs(10, CatchUpPolicy::FireOnce).await.unwrap(), 0);
    assert_eq!(store.list_runs("nightly").await.unwrap().len(), 1);
}

#[tokio::test]
async fn skip_missed_policy_only_advances() {
    let store = MemoryCronJobStore::new();
    store
        .upsert_job(JobSpec::new("hourly", "0 0 * * * *", "t", json!({})))
        .await
        .unwrap();
    store.set_next_due("hourly", Utc::now() - chrono::Duration::hours(3));

    assert_eq!(store.plan_due_jobs(10, CatchUpPolicy::SkipMissed).await.unwrap(), 0);
    assert!(store.list_runs("hourly").await.unwrap().is_empty());
    assert!(store.get_job("hourly").await.unwrap().unwrap().next_due.unwrap() > Utc::now());
}

#[tokio::test]
async fn disabled_jobs_materialize_nothing() {
    let store = MemoryCronJobStore::new();
    store
        .upsert_job(JobSpec::new("job", "0 * * * * *", "t", json!({})))
        .await
        .unwrap();
    assert!(store.set_job_enabled("job", false).await.unwrap());
    store.set_next_due("job", Utc::now() - chrono::Duration::minutes(10));

    assert_eq!(store.plan_due_jobs(10, CatchUpPolicy::FireOnce).await.unwrap(), 0);
    assert!(!store.set_job_enabled("ghost", false).await.unwrap());
}

#[tokio::test]
async fn trigger_materializes_an_immediate_run() {
    let store = MemoryCronJobStore::new();
    store
        .upsert_job(JobSpec::new("job", "0 0 2 * * *", "t", json!({"a": 1})))
        .await
        .unwrap();

    let run_id = store.trigger_job("job").await.unwrap();
    let owner = OwnerToken::generate();
    let claimed = store.claim(owner, 10, Duration::from_secs(10)).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, run_id);
    assert_eq!(claimed[0].payload, json!({"a": 1}));

    store.ack(owner, &[run_id]).await.unwrap();
    let job = store.get_job("job").await.unwrap().unwrap();
    assert_eq!(job.last_status.as_deref(), Some("succeeded"));
    assert!(job.last_run_at.is_some());

    assert!(store.trigger_job("ghost").await.is_err());
}

// -----------------------------------------------------------------------------
// External side effects
// -----------------------------------------------------------------------------

fn effects(store: &Arc<MemoryEffectStore>) -> SideEffects<MemoryEffectStore> {
    SideEffects::new(Arc::clone(store), "worker-1")
}

#[tokio::test]
async fn effect_runs_once_then_reports_already_completed() {
    let store = Arc::new(MemoryEffectStore::new());
    let side_effects = effects(&store);
    let key = EffectKey::new("payments.transfer", "order-1");
    let calls = Arc::new(AtomicUsize::new(0));

    let run_calls = Arc::clone(&calls);
    let outcome = side_effects
        .execute(key.clone(), None::<std::future::Ready<anyhow::Result<CheckOutcome>>>, async move {
            run_calls.fetch_add(1, Ordering::SeqCst);
            Ok(EffectSuccess {
                external_reference_id: Some("tx-77".to_string()),
                external_status: Some("settled".to_string()),
            })
        })
        .await
        .unwrap();
    assert_eq!(outcome, EffectOutcome::Completed);

    let run_calls = Arc::clone(&calls);
    let outcome = side_effects
        .execute(key.clone(), None::<std::future::Ready<anyhow::Result<CheckOutcome>>>, async move {
            run_calls.fetch_add(1, Ordering::SeqCst);
            Ok(EffectSuccess::default())
        })
        .await
        .unwrap();
    assert_eq!(outcome, EffectOutcome::AlreadyCompleted);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let record = store.get(&key).await.unwrap().unwrap();
    assert_eq!(record.status, EffectStatus::Succeeded);
    assert_eq!(record.external_reference_id.as_deref(), Some("tx-77"));
}

#[tokio::test]
async fn effect_attempt_lock_excludes_concurrent_workers() {
    let store = Arc::new(MemoryEffectStore::new());
    let side_effects = effects(&store);
    let key = EffectKey::new("payments.transfer", "order-2");

    let record = store.get_or_create(&key, None).await.unwrap();
    assert!(store
        .try_begin_attempt(record.id, "other-worker", Duration::from_secs(60))
        .await
        .unwrap());

    let outcome = side_effects
        .execute(key, None::<std::future::Ready<anyhow::Result<CheckOutcome>>>, async {
            panic!("must not run while another worker holds the lock")
        })
        .await
        .unwrap();
    assert_eq!(outcome, EffectOutcome::RetryScheduled);
}

#[tokio::test]
async fn effect_failures_classify_into_retry_and_permanent() {
    let store = Arc::new(MemoryEffectStore::new());
    let side_effects = effects(&store);
    let key = EffectKey::new("payments.transfer", "order-3");

    let outcome = side_effects
        .execute(key.clone(), None::<std::future::Ready<anyhow::Result<CheckOutcome>>>, async {
            Err(HandlerFailure::transient(anyhow::anyhow!("gateway timeout")))
        })
        .await
        .unwrap();
    assert_eq!(outcome, EffectOutcome::RetryScheduled);

    let record = store.get(&key).await.unwrap().unwrap();
    assert_eq!(record.status, EffectStatus::Pending);
    assert_eq!(record.attempt_count, 1);
    assert!(record.locked_until.is_none());

    let outcome = side_effects
        .execute(key.clone(), None::<std::future::Ready<anyhow::Result<CheckOutcome>>>, async {
            Err(HandlerFailure::permanent(anyhow::anyhow!("account closed")))
        })
        .await
        .unwrap();
    assert_eq!(outcome, EffectOutcome::PermanentFailure);

    // Permanent failure persists.
    let outcome = side_effects
        .execute(key.clone(), None::<std::future::Ready<anyhow::Result<CheckOutcome>>>, async {
            Ok(EffectSuccess::default())
        })
        .await
        .unwrap();
    assert_eq!(outcome, EffectOutcome::PermanentFailure);
    assert_eq!(store.get(&key).await.unwrap().unwrap().status, EffectStatus::Failed);
}

#[tokio::test]
async fn effect_check_confirms_ambiguous_prior_attempt() {
    let store = Arc::new(MemoryEffectStore::new());
    let side_effects = effects(&store);
    let key = EffectKey::new("payments.transfer", "order-4");

    // First attempt dies ambiguously (transient).
    side_effects
        .execute(key.clone(), None::<std::future::Ready<anyhow::Result<CheckOutcome>>>, async {
            Err(HandlerFailure::transient(anyhow::anyhow!("connection reset mid-call")))
        })
        .await
        .unwrap();

    // Retry probes first; the external system says it went through.
    let ran = Arc::new(AtomicUsize::new(0));
    let run_ran = Arc::clone(&ran);
    let outcome = side_effects
        .execute(
            key.clone(),
            Some(async {
                Ok(CheckOutcome::Confirmed(EffectSuccess {
                    external_reference_id: Some("tx-88".to_string()),
                    external_status: None,
                }))
            }),
            async move {
                run_ran.fetch_add(1, Ordering::SeqCst);
                Ok(EffectSuccess::default())
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome, EffectOutcome::Completed);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    let record = store.get(&key).await.unwrap().unwrap();
    assert_eq!(record.status, EffectStatus::Succeeded);
    assert_eq!(record.external_reference_id.as_deref(), Some("tx-88"));
    assert!(record.last_external_check_at.is_some());
}

#[tokio::test]
async fn inconclusive_check_defers_by_default_and_attempts_when_configured() {
    let store = Arc::new(MemoryEffectStore::new());
    let key = EffectKey::new("payments.transfer", "order-5");

    let side_effects = effects(&store);
    side_effects
        .execute(key.clone(), None::<std::future::Ready<anyhow::Result<CheckOutcome>>>, async {
            Err(HandlerFailure::transient(anyhow::anyhow!("timeout")))
        })
        .await
        .unwrap();

    // Default RetryLater: an Unknown probe schedules a retry, nothing runs.
    let outcome = side_effects
        .execute(key.clone(), Some(async { Ok(CheckOutcome::Unknown) }), async {
            panic!("must not attempt on an inconclusive probe")
        })
        .await
        .unwrap();
    assert_eq!(outcome, EffectOutcome::RetryScheduled);

    // Attempt behavior proceeds past the inconclusive probe. A fresh
    // coordinator with a zero check interval so the probe is due again.
    let attempting = SideEffects::new(Arc::clone(&store), "worker-2").with_config(EffectConfig {
        min_check_interval: Duration::ZERO,
        unknown_check_behavior: UnknownCheckBehavior::Attempt,
        ..EffectConfig::default()
    });
    let outcome = attempting
        .execute(key.clone(), Some(async { Ok(CheckOutcome::Unknown) }), async {
            Ok(EffectSuccess::default())
        })
        .await
        .unwrap();
    assert_eq!(outcome, EffectOutcome::Completed);
}

// -----------------------------------------------------------------------------
// Dispatcher end-to-end
// -----------------------------------------------------------------------------

fn fast_dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        batch_size: 10,
        lease: Duration::from_secs(5),
        heartbeat_fraction: 0.5,
        min_poll_interval: Duration::from_millis(5),
        max_poll_interval: Duration::from_millis(20),
        max_attempts: 3,
        backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
        worker_id: "test-worker".to_string(),
    }
}

#[tokio::test]
async fn dispatcher_settles_by_handler_outcome() {
    let store = Arc::new(MemoryOutboxStore::new());
    let registry = Arc::new(HandlerRegistry::new());

    registry
        .register("ok", Arc::new(handler_fn(|_msg, _ctx| async { Ok(()) })))
        .unwrap();

    let flaky_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&flaky_calls);
    registry
        .register(
            "flaky",
            Arc::new(handler_fn(move |_msg, _ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(HandlerFailure::transient(anyhow::anyhow!("first try fails")))
                    } else {
                        Ok(())
                    }
                }
            })),
        )
        .unwrap();

    registry
        .register(
            "broken",
            Arc::new(handler_fn(|_msg, _ctx| async {
                Err(HandlerFailure::permanent(anyhow::anyhow!("bad payload")))
            })),
        )
        .unwrap();

    let ok = store.enqueue(message("ok")).await.unwrap().id();
    let flaky = store.enqueue(message("flaky")).await.unwrap().id();
    let broken = store.enqueue(message("broken")).await.unwrap().id();
    let orphan = store.enqueue(message("no.such.topic")).await.unwrap().id();

    let dispatcher = Dispatcher::new(Arc::clone(&store), registry, fast_dispatcher_config());
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(Box::new(dispatcher).run(shutdown.clone()));

    // Give the loop a few cycles, including the flaky retry backoff.
    tokio::time::sleep(Duration::from_millis(400)).await;
    shutdown.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(store.get(ok).await.unwrap().unwrap().status, MessageStatus::Dispatched);

    let flaky_row = store.get(flaky).await.unwrap().unwrap();
    assert_eq!(flaky_row.status, MessageStatus::Dispatched);
    assert_eq!(flaky_row.attempt_count, 1);
    assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);

    let broken_row = store.get(broken).await.unwrap().unwrap();
    assert_eq!(broken_row.status, MessageStatus::Failed);
    assert!(broken_row.last_error.as_deref().unwrap().contains("bad payload"));

    let orphan_row = store.get(orphan).await.unwrap().unwrap();
    assert_eq!(orphan_row.status, MessageStatus::Failed);
    assert!(orphan_row
        .last_error
        .as_deref()
        .unwrap()
        .contains("no handler registered"));
}

#[tokio::test]
async fn dispatcher_exhausts_attempts_into_dead_letter() {
    let store = Arc::new(MemoryOutboxStore::new());
    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register(
            "always.fails",
            Arc::new(handler_fn(|_msg, _ctx| async {
                Err(HandlerFailure::transient(anyhow::anyhow!("still down")))
            })),
        )
        .unwrap();

    let id = store.enqueue(message("always.fails")).await.unwrap().id();

    let mut config = fast_dispatcher_config();
    config.max_attempts = 2;
    let dispatcher = Dispatcher::new(Arc::clone(&store), registry, config);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(Box::new(dispatcher).run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();
    task.await.unwrap().unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Failed);
    assert!(row.last_error.as_deref().unwrap().contains("max attempts exceeded"));
}

#[tokio::test]
async fn heartbeat_keeps_long_handlers_alive_through_reaping() {
    let store = Arc::new(MemoryOutboxStore::new());
    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register(
            "slow",
            Arc::new(handler_fn(|_msg, _ctx| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })),
        )
        .unwrap();

    let id = store.enqueue(message("slow")).await.unwrap().id();

    let mut config = fast_dispatcher_config();
    config.lease = Duration::from_millis(100);
    let dispatcher = Dispatcher::new(Arc::clone(&store), registry, config);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(Box::new(dispatcher).run(shutdown.clone()));

    // Reap aggressively while the handler runs; heartbeats must keep the
    // lease ahead of the reaper.
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.reap_expired(100).await.unwrap();
    }

    shutdown.cancel();
    task.await.unwrap().unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Dispatched);
    assert_eq!(row.attempt_count, 0);
}
