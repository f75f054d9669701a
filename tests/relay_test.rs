//! Relay workers: leasing, retry/backoff, failure handling and crash
//! takeover, against the in-memory ledger and replica.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ledgersync::clock::{Clock, ManualClock};
use ledgersync::engine::{Engine, Submitted};
use ledgersync::error::Error;
use ledgersync::lease::WorkerId;
use ledgersync::ledger::{Ledger, MemoryLedger};
use ledgersync::model::outbox::LedgerMutation;
use ledgersync::model::work::{NewWorkItem, Status, WorkId};
use ledgersync::notify::{FailureKind, FailureNotice, FailureNotifier};
use ledgersync::relay::{DeliveryResult, RelayConfig, RetryPolicy};
use ledgersync::replica::{FieldOwnership, MemoryReplica, OWNERS_FIELD};
use serde_json::json;

#[derive(Default)]
struct RecordingNotifier {
    notices: Mutex<Vec<FailureNotice>>,
}

impl RecordingNotifier {
    fn notices(&self) -> Vec<FailureNotice> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl FailureNotifier for RecordingNotifier {
    async fn notify(&self, notice: FailureNotice) {
        self.notices.lock().unwrap().push(notice);
    }
}

struct Harness {
    ledger: Arc<MemoryLedger>,
    replica: Arc<MemoryReplica>,
    clock: Arc<ManualClock>,
    notifier: Arc<RecordingNotifier>,
    engine: Engine,
}

fn relay_config(max_retries: u32) -> RelayConfig {
    RelayConfig {
        lease_ttl: Duration::from_secs(30),
        poll_interval: Duration::from_millis(10),
        attempt_timeout: Duration::from_secs(5),
        batch_size: 8,
        retry: RetryPolicy {
            floor: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_retries,
        },
    }
}

fn harness_with(config: RelayConfig) -> Harness {
    let ledger = Arc::new(MemoryLedger::new());
    let replica = Arc::new(MemoryReplica::new());
    let clock = Arc::new(ManualClock::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = Engine::builder(
        ledger.clone(),
        replica.clone(),
        FieldOwnership::new("ledgersync", 1, ["amount", "creditor"]),
    )
    .collection("replies")
    .clock(clock.clone())
    .notifier(notifier.clone())
    .relay_config(config)
    .build()
    .unwrap();
    Harness {
        ledger,
        replica,
        clock,
        notifier,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(relay_config(5))
}

impl Harness {
    /// Submit and step the clock, so items lease in submission order.
    async fn submit(&self, business_key: &str, amount: i64) -> WorkId {
        let mutation = LedgerMutation::new()
            .set("amount", amount)
            .set("creditor", "ACME");
        let submitted = self
            .engine
            .submit(NewWorkItem::new(business_key), mutation)
            .await
            .unwrap();
        self.clock.advance(Duration::from_millis(1));
        match submitted {
            Submitted::Committed { work_id, .. } => work_id,
            Submitted::Duplicate { .. } => panic!("unexpected duplicate"),
        }
    }

    fn clock_now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    async fn poll(&self, worker: &str) -> Option<DeliveryResult> {
        self.engine
            .relay()
            .poll_once(&WorkerId::new(worker))
            .await
            .unwrap()
    }

    async fn status(&self, id: WorkId) -> Status {
        self.ledger.get_work_item(id).await.unwrap().status
    }
}

#[tokio::test]
async fn delivers_owned_fields_and_completes() {
    let h = harness();
    let id = h.submit("reply-1", 500).await;
    h.replica
        .edit_field("replies", "reply-1", "assignee", json!("bob"))
        .await;

    let result = h.poll("w1").await;
    assert_eq!(
        result,
        Some(DeliveryResult::Completed {
            work_id: id,
            cached: false
        })
    );

    let item = h.ledger.get_work_item(id).await.unwrap();
    assert_eq!(item.status, Status::Completed);
    assert!(item.lease_owner.is_none());
    assert!(item.completed_at.is_some());

    let doc = h.replica.document("replies", "reply-1").await.unwrap();
    assert_eq!(doc["amount"], json!(500));
    assert_eq!(doc["creditor"], json!("ACME"));
    assert_eq!(doc["assignee"], json!("bob"));
    assert_eq!(doc[OWNERS_FIELD]["ledgersync"]["source_version"], json!(1));

    let record = &h.ledger.outbox_for_work(id).await.unwrap()[0];
    assert!(record.delivered_at.is_some());
    assert_eq!(record.delivery_attempts, 1);

    let baseline = h.ledger.sync_baseline("reply-1").await.unwrap().unwrap();
    assert_eq!(baseline.synced_version, 1);

    assert_eq!(h.poll("w1").await, None);
}

#[tokio::test]
async fn transient_failures_back_off_then_complete() {
    let h = harness();
    let id = h.submit("reply-1", 500).await;
    h.replica.fail_transiently("reply-1", 3).await;

    for expected_retry in 1..=3u32 {
        match h.poll("w1").await {
            Some(DeliveryResult::Retrying {
                retry_count,
                next_attempt_at,
                ..
            }) => {
                assert_eq!(retry_count, expected_retry);
                let item = h.ledger.get_work_item(id).await.unwrap();
                assert_eq!(item.status, Status::Queued);
                assert_eq!(item.next_attempt_at, Some(next_attempt_at));
                assert!(item.lease_owner.is_none());
            }
            other => panic!("expected a retry, got {other:?}"),
        }

        // Still backing off.
        assert_eq!(h.poll("w1").await, None);
        h.clock.advance(Duration::from_secs(60));
    }

    assert!(matches!(
        h.poll("w1").await,
        Some(DeliveryResult::Completed { cached: false, .. })
    ));
    let item = h.ledger.get_work_item(id).await.unwrap();
    assert_eq!(item.status, Status::Completed);
    assert_eq!(item.retry_count, 3);
    assert_eq!(h.replica.applied_writes(), 1);
    assert!(h.notifier.notices().is_empty());
}

#[tokio::test]
async fn backoff_doubles_from_the_floor() {
    let h = harness();
    h.submit("reply-1", 500).await;
    h.replica.fail_transiently("reply-1", 2).await;

    let start = h.clock_now();
    let Some(DeliveryResult::Retrying {
        next_attempt_at, ..
    }) = h.poll("w1").await
    else {
        panic!("expected a retry");
    };
    assert_eq!(next_attempt_at - start, chrono::Duration::seconds(1));

    h.clock.advance(Duration::from_secs(1));
    let start = h.clock_now();
    let Some(DeliveryResult::Retrying {
        next_attempt_at, ..
    }) = h.poll("w1").await
    else {
        panic!("expected a second retry");
    };
    assert_eq!(next_attempt_at - start, chrono::Duration::seconds(2));
}

#[tokio::test]
async fn permanent_failure_fails_once_and_notifies() {
    let h = harness();
    let id = h.submit("reply-1", 500).await;
    h.replica.reject("reply-1").await;

    assert_eq!(
        h.poll("w1").await,
        Some(DeliveryResult::Failed {
            work_id: id,
            kind: FailureKind::Permanent
        })
    );

    let item = h.ledger.get_work_item(id).await.unwrap();
    assert_eq!(item.status, Status::Failed);
    assert_eq!(item.retry_count, 0);
    assert!(item.last_error.as_deref().unwrap_or_default().contains("rejected"));

    let notices = h.notifier.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].work_id, id);
    assert_eq!(notices[0].kind, FailureKind::Permanent);
    assert_eq!(notices[0].business_key, "reply-1");

    // Failed is terminal for the relay.
    h.clock.advance(Duration::from_secs(3600));
    assert_eq!(h.poll("w1").await, None);
    assert_eq!(h.notifier.notices().len(), 1);
}

#[tokio::test]
async fn exhausted_retries_fail_and_notify() {
    let h = harness_with(relay_config(2));
    let id = h.submit("reply-1", 500).await;
    h.replica.fail_transiently("reply-1", 10).await;

    for _ in 0..2 {
        assert!(matches!(
            h.poll("w1").await,
            Some(DeliveryResult::Retrying { .. })
        ));
        h.clock.advance(Duration::from_secs(60));
    }
    assert_eq!(
        h.poll("w1").await,
        Some(DeliveryResult::Failed {
            work_id: id,
            kind: FailureKind::Exhausted
        })
    );

    let item = h.ledger.get_work_item(id).await.unwrap();
    assert_eq!(item.status, Status::Failed);
    assert_eq!(item.retry_count, 3);

    let notices = h.notifier.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, FailureKind::Exhausted);
    assert_eq!(notices[0].retry_count, 3);
}

#[tokio::test]
async fn live_lease_is_skipped_by_other_workers() {
    let h = harness();
    let first = h.submit("reply-1", 500).await;
    let second = h.submit("reply-2", 700).await;
    let relay = h.engine.relay();

    let leased = relay.lease_next(&WorkerId::new("w1")).await.unwrap().unwrap();
    assert_eq!(leased.id, first);
    assert_eq!(leased.status, Status::Processing);

    let other = relay.lease_next(&WorkerId::new("w2")).await.unwrap().unwrap();
    assert_eq!(other.id, second);

    assert!(relay.lease_next(&WorkerId::new("w3")).await.unwrap().is_none());
}

#[tokio::test]
async fn expired_lease_is_taken_over_without_double_write() {
    let h = harness();
    let id = h.submit("reply-1", 500).await;
    let relay = h.engine.relay();
    let crashed = WorkerId::new("crashed");

    let stale = relay.lease_next(&crashed).await.unwrap().unwrap();
    assert!(relay.lease_next(&WorkerId::new("w2")).await.unwrap().is_none());

    h.clock.advance(Duration::from_secs(31));
    assert_eq!(
        h.poll("w2").await,
        Some(DeliveryResult::Completed {
            work_id: id,
            cached: false
        })
    );

    // The original holder wakes up and tries to finish its attempt.
    let late = relay.deliver(&crashed, stale).await.unwrap();
    assert_eq!(late, DeliveryResult::LeaseLost { work_id: id });
    assert_eq!(h.status(id).await, Status::Completed);
    assert_eq!(h.replica.applied_writes(), 1);
}

#[tokio::test]
async fn outcome_writes_require_the_lease() {
    let h = harness();
    let id = h.submit("reply-1", 500).await;
    h.engine
        .relay()
        .lease_next(&WorkerId::new("w1"))
        .await
        .unwrap()
        .unwrap();

    let err = h
        .ledger
        .fail_work(id, &WorkerId::new("w2"), 0, "not mine", h.clock_now())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LeaseLost(lost) if lost == id));
    assert_eq!(h.status(id).await, Status::Processing);
}

#[tokio::test]
async fn reset_to_queued_redelivers_idempotently() {
    let h = harness();
    let id = h.submit("reply-1", 500).await;
    h.poll("w1").await.unwrap();
    let before = h.replica.document("replies", "reply-1").await.unwrap();

    let reset = h.engine.reset_to_queued(id).await.unwrap();
    assert_eq!(reset.status, Status::Queued);
    assert_eq!(reset.retry_count, 1);

    assert_eq!(
        h.poll("w2").await,
        Some(DeliveryResult::Completed {
            work_id: id,
            cached: true
        })
    );
    let after = h.replica.document("replies", "reply-1").await.unwrap();
    assert_eq!(before, after);
    assert_eq!(h.replica.applied_writes(), 1);
}

#[tokio::test]
async fn reset_takes_over_a_leased_item() {
    let h = harness();
    let id = h.submit("reply-1", 500).await;
    let relay = h.engine.relay();
    let holder = WorkerId::new("w1");
    let leased = relay.lease_next(&holder).await.unwrap().unwrap();

    h.engine.reset_to_queued(id).await.unwrap();
    let status = h.engine.status(id).await.unwrap();
    assert_eq!(status.status, Status::Queued);
    assert!(!status.lease_live);

    assert_eq!(
        relay.deliver(&holder, leased).await.unwrap(),
        DeliveryResult::LeaseLost { work_id: id }
    );
    assert!(matches!(
        h.poll("w2").await,
        Some(DeliveryResult::Completed { .. })
    ));
}

#[tokio::test]
async fn newer_replica_version_is_not_overwritten() {
    let h = harness();
    let first = h.submit("reply-1", 500).await;
    let second = h.submit("reply-1", 450).await;
    let relay = h.engine.relay();

    // Deliver the newer record first.
    let w1 = WorkerId::new("w1");
    let older = relay.lease_next(&w1).await.unwrap().unwrap();
    assert_eq!(older.id, first);
    let w2 = WorkerId::new("w2");
    let newer = relay.lease_next(&w2).await.unwrap().unwrap();
    assert_eq!(newer.id, second);

    relay.deliver(&w2, newer).await.unwrap();
    relay.deliver(&w1, older).await.unwrap();

    let doc = h.replica.document("replies", "reply-1").await.unwrap();
    assert_eq!(doc["amount"], json!(450));
    assert_eq!(doc[OWNERS_FIELD]["ledgersync"]["source_version"], json!(2));
    assert_eq!(h.status(first).await, Status::Completed);
    assert_eq!(
        h.ledger
            .sync_baseline("reply-1")
            .await
            .unwrap()
            .unwrap()
            .synced_version,
        2
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_share_a_lease() {
    let h = harness();
    let mut ids = Vec::new();
    for i in 0..40 {
        ids.push(h.submit(&format!("reply-{i}"), 100 + i).await);
    }

    let relay = Arc::clone(h.engine.relay());
    let mut joins = Vec::new();
    for w in 0..6 {
        let relay = Arc::clone(&relay);
        joins.push(tokio::spawn(async move {
            let worker = WorkerId::new(format!("w{w}"));
            let mut delivered = Vec::new();
            while let Some(result) = relay.poll_once(&worker).await.unwrap() {
                delivered.push(result);
            }
            delivered
        }));
    }

    let mut completions: HashMap<WorkId, u32> = HashMap::new();
    for join in joins {
        for result in join.await.unwrap() {
            assert!(
                matches!(result, DeliveryResult::Completed { cached: false, .. }),
                "unexpected result {result:?}"
            );
            *completions.entry(result.work_id()).or_default() += 1;
        }
    }

    assert_eq!(completions.len(), ids.len());
    assert!(completions.values().all(|&n| n == 1));
    assert_eq!(h.replica.applied_writes(), ids.len() as u64);
}

#[tokio::test]
async fn worker_pool_drains_the_queue_and_shuts_down() {
    let h = harness();
    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(h.submit(&format!("reply-{i}"), i).await);
    }

    let pool = h.engine.spawn_workers(3);
    assert_eq!(pool.workers().len(), 3);

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let mut done = 0;
            for id in &ids {
                if h.status(*id).await == Status::Completed {
                    done += 1;
                }
            }
            if done == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "workers did not drain the queue");

    pool.shutdown_and_join().await;
    assert_eq!(h.ledger.backlog().await.unwrap().undelivered, 0);
}
