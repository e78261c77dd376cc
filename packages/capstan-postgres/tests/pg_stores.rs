//! Integration tests against a real Postgres in a container.
//!
//! The container is started once and shared across tests. Run with Docker
//! available:
//!
//! ```sh
//! cargo test -p capstan-postgres -- --ignored
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use capstan::cron::CatchUpPolicy;
use capstan::inbox::{InboxStore, ObserveOutcome, ObservedMessage};
use capstan::join::{JoinStatus, JoinStore};
use capstan::lease::{AcquireOutcome, LeaseStore, RenewOutcome};
use capstan::outbox::{NewOutboxMessage, OutboxStore};
use capstan::scheduler::{CronJobStore, JobSpec};
use capstan::semaphore::{ReleaseOutcome, SemaphoreStore, TryAcquireOutcome};
use capstan::workqueue::{MessageQueue, MessageStatus, OwnerToken};
use serde_json::json;
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

use capstan_postgres::{
    schema, PgCronJobStore, PgInboxStore, PgLeaseStore, PgOutboxStore, PgSemaphoreStore,
};

struct SharedPg {
    pool: PgPool,
    _container: ContainerAsync<Postgres>,
}

static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

impl SharedPg {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let container = Postgres::default()
            .start()
            .await
            .context("failed to start postgres container")?;
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&url)
            .await
            .context("failed to connect to container")?;
        schema::migrate(&pool).await?;
        Ok(Self {
            pool,
            _container: container,
        })
    }

    async fn pool() -> PgPool {
        SHARED_PG
            .get_or_init(|| async { Self::init().await.expect("shared postgres init failed") })
            .await
            .pool
            .clone()
    }
}

fn message(topic: &str) -> NewOutboxMessage {
    NewOutboxMessage::new(topic, json!({}))
}

#[tokio::test]
#[ignore = "requires docker"]
async fn migrate_is_idempotent() {
    let pool = SharedPg::pool().await;
    schema::migrate(&pool).await.unwrap();
    schema::migrate(&pool).await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn outbox_claim_ack_round_trip() {
    let pool = SharedPg::pool().await;
    let store = PgOutboxStore::new(pool);

    let id = store.enqueue(message("pg.roundtrip")).await.unwrap().id();
    let duplicate_check = store
        .enqueue(message("pg.roundtrip").with_message_id(uuid::Uuid::new_v4()))
        .await
        .unwrap();
    assert!(duplicate_check.is_created());

    let owner = OwnerToken::generate();
    let claimed = store.claim(owner, 50, Duration::from_secs(10)).await.unwrap();
    assert!(claimed.iter().any(|m| m.id == id));

    // A second claimer sees nothing for the locked rows.
    let other = store
        .claim(OwnerToken::generate(), 50, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(other.iter().all(|m| m.id != id));

    store.ack(owner, &[id]).await.unwrap();
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Dispatched);
    assert!(row.processed_at.is_some());
    assert!(row.owner_token.is_none());

    // Wrong-owner transitions are no-ops.
    store.fail(OwnerToken::generate(), &[id], Some("late")).await.unwrap();
    assert_eq!(
        store.get(id).await.unwrap().unwrap().status,
        MessageStatus::Dispatched
    );
}

#[tokio::test]
#[ignore = "requires docker"]
async fn outbox_join_fires_and_releases_parent() {
    let pool = SharedPg::pool().await;
    let store = PgOutboxStore::new(pool);

    let enqueued = store
        .enqueue_join(
            message("pg.join.done").with_correlation_id("pg-join-1"),
            vec![message("pg.join.step"), message("pg.join.step")],
            2,
        )
        .await
        .unwrap();

    let owner = OwnerToken::generate();
    // Claim until both children are held (other tests may share the table).
    let mut seen = Vec::new();
    for _ in 0..5 {
        for claimed in store.claim(owner, 50, Duration::from_secs(10)).await.unwrap() {
            if enqueued.child_ids.contains(&claimed.id) {
                seen.push(claimed.id);
            }
        }
        if seen.len() == 2 {
            break;
        }
    }
    assert_eq!(seen.len(), 2, "both join members should be claimable");

    store.ack(owner, &[enqueued.child_ids[0]]).await.unwrap();
    let join = store.get_join(enqueued.join_id).await.unwrap().unwrap();
    assert_eq!((join.completed_steps, join.failed_steps), (1, 0));
    assert_eq!(join.status, JoinStatus::Pending);

    store
        .fail(owner, &[enqueued.child_ids[1]], Some("boom"))
        .await
        .unwrap();
    let join = store.get_join(enqueued.join_id).await.unwrap().unwrap();
    assert_eq!(join.completed_steps + join.failed_steps, 2);
    assert!(join.status.is_terminal());

    // The parent is released and claimable now.
    let parent = store.get(enqueued.parent_id).await.unwrap().unwrap();
    assert_eq!(parent.status, MessageStatus::Pending);
    assert!(parent.due_time.unwrap() <= chrono::Utc::now());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn inbox_dedups_and_processes_once() {
    let pool = SharedPg::pool().await;
    let store = PgInboxStore::new(pool);

    let observed = ObservedMessage::new("pg-m1", "S")
        .with_topic("pg.webhook")
        .with_payload(json!({"n": 1}));
    assert_eq!(store.observe(observed.clone()).await.unwrap(), ObserveOutcome::Accepted);
    assert_eq!(store.observe(observed).await.unwrap(), ObserveOutcome::Duplicate);

    let row = store.get("pg-m1").await.unwrap().unwrap();
    assert!(row.last_seen_at >= row.first_seen_at);

    let owner = OwnerToken::generate();
    let claimed = store.claim(owner, 50, Duration::from_secs(10)).await.unwrap();
    let mine: Vec<_> = claimed.iter().filter(|m| m.id == "pg-m1").collect();
    assert_eq!(mine.len(), 1);

    store.ack(owner, &["pg-m1".to_string()]).await.unwrap();
    let row = store.get("pg-m1").await.unwrap().unwrap();
    assert_eq!(row.status, capstan::workqueue::InboxStatus::Done);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn lease_fencing_is_monotone_across_holders() {
    let pool = SharedPg::pool().await;
    let store = PgLeaseStore::new(pool);
    let x = OwnerToken::generate();
    let y = OwnerToken::generate();

    let AcquireOutcome::Acquired { fencing_token: f1 } = store
        .acquire("pg-resource", x, Duration::from_secs(5), None)
        .await
        .unwrap()
    else {
        panic!("first acquire must succeed")
    };
    assert_eq!(f1, 1);

    let AcquireOutcome::Acquired { fencing_token: f2 } = store
        .acquire("pg-resource", x, Duration::from_secs(5), None)
        .await
        .unwrap()
    else {
        panic!("re-entrant acquire must succeed")
    };
    assert_eq!(f2, 2);

    assert_eq!(
        store
            .acquire("pg-resource", y, Duration::from_secs(5), None)
            .await
            .unwrap(),
        AcquireOutcome::Held
    );

    assert!(matches!(
        store.renew("pg-resource", x, Duration::from_secs(5)).await.unwrap(),
        RenewOutcome::Renewed { fencing_token: 3 }
    ));
    assert_eq!(
        store.renew("pg-resource", y, Duration::from_secs(5)).await.unwrap(),
        RenewOutcome::Lost
    );

    assert!(store.release("pg-resource", x).await.unwrap());
    let AcquireOutcome::Acquired { fencing_token: f4 } = store
        .acquire("pg-resource", y, Duration::from_secs(5), None)
        .await
        .unwrap()
    else {
        panic!("acquire after release must succeed")
    };
    assert_eq!(f4, 4);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn gated_lease_acquire_behaves_like_ungated() {
    let pool = SharedPg::pool().await;
    let store = PgLeaseStore::with_config(
        pool,
        capstan::lease::LeaseConfig {
            use_gate: true,
            gate_timeout: Duration::from_millis(500),
        },
    );
    let owner = OwnerToken::generate();
    let outcome = store
        .acquire("pg-gated", owner, Duration::from_secs(5), None)
        .await
        .unwrap();
    assert_eq!(outcome, AcquireOutcome::Acquired { fencing_token: 1 });
}

#[tokio::test]
#[ignore = "requires docker"]
async fn semaphore_limit_holds_under_postgres() {
    let pool = SharedPg::pool().await;
    let store = PgSemaphoreStore::new(pool);
    store.register("pg-sem", 2).await.unwrap();
    let ttl = Duration::from_secs(30);

    let TryAcquireOutcome::Acquired(l1) =
        store.try_acquire("pg-sem", ttl, "o1", None).await.unwrap()
    else {
        panic!("first slot must acquire")
    };
    let TryAcquireOutcome::Acquired(l2) =
        store.try_acquire("pg-sem", ttl, "o2", None).await.unwrap()
    else {
        panic!("second slot must acquire")
    };
    assert_eq!((l1.fencing_token, l2.fencing_token), (1, 2));

    assert_eq!(
        store.try_acquire("pg-sem", ttl, "o3", None).await.unwrap(),
        TryAcquireOutcome::NotAcquired
    );

    assert_eq!(
        store.release("pg-sem", l1.token).await.unwrap(),
        ReleaseOutcome::Released
    );
    let TryAcquireOutcome::Acquired(l3) =
        store.try_acquire("pg-sem", ttl, "o3", None).await.unwrap()
    else {
        panic!("freed slot must acquire")
    };
    assert_eq!(l3.fencing_token, 3);

}

#[tokio::test]
#[ignore = "requires docker"]
async fn semaphore_acquire_is_idempotent_per_request_id() {
    let pool = SharedPg::pool().await;
    let store = PgSemaphoreStore::new(pool);
    store.register("pg-sem-idem", 1).await.unwrap();
    let ttl = Duration::from_secs(30);

    let TryAcquireOutcome::Acquired(first) = store
        .try_acquire("pg-sem-idem", ttl, "o1", Some("req-1"))
        .await
        .unwrap()
    else {
        panic!("first acquire must succeed")
    };
    let TryAcquireOutcome::Acquired(retry) = store
        .try_acquire("pg-sem-idem", ttl, "o1", Some("req-1"))
        .await
        .unwrap()
    else {
        panic!("idempotent retry must return the live lease")
    };
    assert_eq!(first.token, retry.token);
    assert_eq!(first.fencing_token, retry.fencing_token);
    assert_eq!(store.live_count("pg-sem-idem").await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn scheduler_materializes_single_catchup_run() {
    let pool = SharedPg::pool().await;
    let store = PgCronJobStore::new(pool.clone());

    store
        .upsert_job(JobSpec::new("pg-nightly", "0 */5 * * * *", "pg.reports", json!({})))
        .await
        .unwrap();

    // Rewind next_due an hour to simulate falling behind.
    sqlx::query("UPDATE scheduled_jobs SET next_due = NOW() - INTERVAL '1 hour' WHERE name = $1")
        .bind("pg-nightly")
        .execute(&pool)
        .await
        .unwrap();

    let materialized = store.plan_due_jobs(10, CatchUpPolicy::FireOnce).await.unwrap();
    assert_eq!(materialized, 1);

    let runs = store.list_runs("pg-nightly").await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].scheduled_time.timestamp() % 300, 0);

    let job = store.get_job("pg-nightly").await.unwrap().unwrap();
    assert!(job.next_due.unwrap() > chrono::Utc::now());

    assert_eq!(store.plan_due_jobs(10, CatchUpPolicy::FireOnce).await.unwrap(), 0);
}
