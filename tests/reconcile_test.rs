//! Reconciliation sweeps: classification, repair, stall handling, reports
//! and the scheduler lifecycle.

use std::sync::Arc;
use std::time::Duration;

use ledgersync::clock::ManualClock;
use ledgersync::engine::{Engine, Submitted};
use ledgersync::lease::WorkerId;
use ledgersync::ledger::{Ledger, MemoryLedger};
use ledgersync::model::outbox::LedgerMutation;
use ledgersync::model::report::{DivergenceClass, RepairAction};
use ledgersync::model::work::{NewWorkItem, Status, WorkId};
use ledgersync::reconcile::{ReconcileConfig, ReconcileScheduler};
use ledgersync::relay::DeliveryResult;
use ledgersync::replica::{FieldOwnership, MemoryReplica};
use serde_json::json;

struct Harness {
    ledger: Arc<MemoryLedger>,
    replica: Arc<MemoryReplica>,
    clock: Arc<ManualClock>,
    engine: Engine,
}

fn harness_with(config: ReconcileConfig) -> Harness {
    let ledger = Arc::new(MemoryLedger::new());
    let replica = Arc::new(MemoryReplica::new());
    let clock = Arc::new(ManualClock::default());
    let engine = Engine::builder(
        ledger.clone(),
        replica.clone(),
        FieldOwnership::new("ledgersync", 1, ["amount", "creditor"]),
    )
    .collection("replies")
    .clock(clock.clone())
    .reconcile_config(config)
    .build()
    .unwrap();
    Harness {
        ledger,
        replica,
        clock,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(ReconcileConfig::default())
}

impl Harness {
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

    /// Submit and deliver in one step.
    async fn delivered(&self, business_key: &str, amount: i64) -> WorkId {
        let id = self.submit(business_key, amount).await;
        let result = self
            .engine
            .relay()
            .poll_once(&WorkerId::new("w1"))
            .await
            .unwrap();
        assert!(
            matches!(result, Some(DeliveryResult::Completed { work_id, .. }) if work_id == id),
            "delivery of {business_key} did not complete: {result:?}"
        );
        id
    }

    /// Let completions fall inside the sweep window, then sweep.
    async fn sweep(&self) -> ledgersync::model::report::ReconciliationReport {
        self.clock.advance(Duration::from_secs(1));
        self.engine.reconcile_now().await.unwrap()
    }
}

#[tokio::test]
async fn consistent_stores_score_full_health() {
    let h = harness();
    for i in 0..10 {
        h.delivered(&format!("reply-{i}"), 100 + i).await;
    }

    let report = h.sweep().await;
    assert_eq!(report.checked(), 10);
    assert_eq!(report.counts.no_action, 10);
    assert_eq!(report.divergent(), 0);
    assert_eq!(report.health_score, 1.0);
    assert!(report.findings.is_empty());
}

#[tokio::test]
async fn health_reflects_divergent_share() {
    let h = harness();
    for i in 0..10 {
        h.delivered(&format!("reply-{i}"), 100 + i).await;
    }
    for i in 0..3 {
        h.replica
            .edit_field("replies", &format!("reply-{i}"), "amount", json!(1))
            .await;
    }

    let report = h.sweep().await;
    assert_eq!(report.checked(), 10);
    assert_eq!(report.divergent(), 3);
    assert_eq!(report.counts.manual_review, 3);
    assert!((report.health_score - 0.7).abs() < 1e-9);
    assert_eq!(report.findings.len(), 3);
}

#[tokio::test]
async fn replica_edit_is_flagged_for_manual_review() {
    let h = harness();
    let id = h.delivered("reply-1", 500).await;
    h.replica
        .edit_field("replies", "reply-1", "amount", json!(450))
        .await;

    let report = h.sweep().await;
    assert_eq!(report.counts.manual_review, 1);
    let finding = report
        .findings_of(DivergenceClass::ManualReview)
        .next()
        .unwrap();
    assert_eq!(finding.work_id, id);
    assert_eq!(finding.action, RepairAction::Flagged);
    assert!(finding.detail.contains("450"));

    // Never auto-resolved.
    let doc = h.replica.document("replies", "reply-1").await.unwrap();
    assert_eq!(doc["amount"], json!(450));
    let again = h.sweep().await;
    assert_eq!(again.counts.manual_review, 1);
}

#[tokio::test]
async fn missing_document_is_rewritten_from_the_ledger() {
    let h = harness();
    h.delivered("reply-1", 500).await;
    h.replica.remove_document("replies", "reply-1").await;

    let report = h.sweep().await;
    assert_eq!(report.counts.re_syncable, 1);
    assert_eq!(report.repairs_taken(), 1);
    assert_eq!(
        report.findings[0].action,
        RepairAction::Rewritten { version: 1 }
    );

    let doc = h.replica.document("replies", "reply-1").await.unwrap();
    assert_eq!(doc["amount"], json!(500));

    let next = h.sweep().await;
    assert_eq!(next.counts.no_action, 1);
    assert_eq!(next.health_score, 1.0);
}

#[tokio::test]
async fn ledger_ahead_of_replica_is_resynced() {
    let h = harness();
    h.delivered("reply-1", 500).await;
    // A newer mutation committed but not delivered yet.
    let pending = h.submit("reply-1", 450).await;

    let report = h.sweep().await;
    assert_eq!(report.counts.re_syncable, 1);
    assert_eq!(
        report.findings[0].action,
        RepairAction::Rewritten { version: 2 }
    );
    let doc = h.replica.document("replies", "reply-1").await.unwrap();
    assert_eq!(doc["amount"], json!(450));

    // The relay can still deliver the pending record; the replica is unchanged.
    let result = h
        .engine
        .relay()
        .poll_once(&WorkerId::new("w1"))
        .await
        .unwrap();
    assert!(matches!(result, Some(DeliveryResult::Completed { work_id, .. }) if work_id == pending));
    assert_eq!(
        h.replica.document("replies", "reply-1").await.unwrap()["amount"],
        json!(450)
    );
}

#[tokio::test]
async fn stalled_item_is_requeued_then_flagged() {
    let config = ReconcileConfig {
        stall_threshold: Duration::from_secs(120),
        max_stall_requeues: 1,
        ..ReconcileConfig::default()
    };
    let h = harness_with(config);
    let id = h.submit("reply-1", 500).await;
    let relay = h.engine.relay();

    relay.lease_next(&WorkerId::new("crashed")).await.unwrap().unwrap();
    h.clock.advance(Duration::from_secs(180));

    let first = h.sweep().await;
    assert_eq!(first.counts.stalled, 1);
    assert_eq!(first.findings[0].action, RepairAction::Requeued);
    let item = h.ledger.get_work_item(id).await.unwrap();
    assert_eq!(item.status, Status::Queued);
    assert_eq!(item.stall_count, 1);
    assert!(item.lease_owner.is_none());

    // Stalls again.
    relay.lease_next(&WorkerId::new("crashed-again")).await.unwrap().unwrap();
    h.clock.advance(Duration::from_secs(180));

    let second = h.sweep().await;
    assert_eq!(second.counts.stalled, 1);
    assert_eq!(second.findings[0].action, RepairAction::Flagged);
    assert_eq!(h.ledger.get_work_item(id).await.unwrap().status, Status::Processing);
}

#[tokio::test]
async fn live_lease_is_not_stalled() {
    let config = ReconcileConfig {
        stall_threshold: Duration::from_secs(10),
        ..ReconcileConfig::default()
    };
    let h = harness_with(config);
    h.submit("reply-1", 500).await;
    h.engine
        .relay()
        .lease_next(&WorkerId::new("slow"))
        .await
        .unwrap()
        .unwrap();
    h.clock.advance(Duration::from_secs(15));

    let report = h.sweep().await;
    assert_eq!(report.counts.stalled, 0);
    assert_eq!(report.checked(), 0);
    assert_eq!(report.health_score, 1.0);
}

#[tokio::test]
async fn unreachable_replica_skips_keys() {
    let h = harness();
    h.delivered("reply-1", 500).await;
    h.replica.set_down(true).await;

    let report = h.sweep().await;
    assert_eq!(report.checked(), 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.health_score, 1.0);
}

#[tokio::test]
async fn items_outside_the_window_are_not_checked() {
    let config = ReconcileConfig {
        lookback: Duration::from_secs(3600),
        ..ReconcileConfig::default()
    };
    let h = harness_with(config);
    h.delivered("reply-1", 500).await;
    h.replica
        .edit_field("replies", "reply-1", "amount", json!(1))
        .await;
    h.clock.advance(Duration::from_secs(7200));

    let report = h.sweep().await;
    assert_eq!(report.checked(), 0);
}

#[tokio::test]
async fn reports_are_stored_newest_first() {
    let h = harness();
    h.delivered("reply-1", 500).await;

    let first = h.sweep().await;
    let second = h.sweep().await;
    assert_ne!(first.run_id, second.run_id);

    let reports = h.engine.recent_reports(10).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].run_id, second.run_id);
    assert_eq!(h.engine.report(first.run_id).await.unwrap(), first);

    // Reports are append-only.
    assert!(h.ledger.append_report(&first).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn scheduler_sweeps_on_interval_and_on_demand() {
    let h = harness();
    h.delivered("reply-1", 500).await;

    let scheduler = ReconcileScheduler::start(
        Arc::clone(h.engine.reconciler()),
        Duration::from_secs(60),
    );

    let triggered = scheduler.trigger().await.unwrap();
    assert_eq!(h.engine.recent_reports(10).await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_secs(61)).await;
    let reports = h.engine.recent_reports(10).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert_ne!(reports[0].run_id, triggered.run_id);

    scheduler.shutdown().await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.engine.recent_reports(10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn failed_delivery_is_flagged_until_reset() {
    let h = harness();
    let id = h.submit("reply-1", 500).await;
    h.replica.fail_transiently("reply-1", 100).await;
    let relay = h.engine.relay();
    loop {
        match relay.poll_once(&WorkerId::new("w1")).await.unwrap() {
            Some(DeliveryResult::Retrying { .. }) => h.clock.advance(Duration::from_secs(600)),
            Some(DeliveryResult::Failed { work_id, .. }) => {
                assert_eq!(work_id, id);
                break;
            }
            other => panic!("unexpected poll result: {other:?}"),
        }
    }
    // The replica recovers, but only a reset may redeliver.
    h.replica.fail_transiently("reply-1", 0).await;

    let report = h.sweep().await;
    assert_eq!(report.counts.re_syncable, 1);
    assert_eq!(report.findings[0].action, RepairAction::Flagged);
    assert!(report.findings[0].detail.contains("operator reset"));
    assert_eq!(report.repairs_taken(), 0);
    assert!(h.replica.document("replies", "reply-1").await.is_none());
    assert_eq!(h.ledger.get_work_item(id).await.unwrap().status, Status::Failed);
    assert_eq!(h.ledger.backlog().await.unwrap().undelivered, 1);

    h.engine.reset_to_queued(id).await.unwrap();
    let redelivered = relay.poll_once(&WorkerId::new("w1")).await.unwrap();
    assert!(matches!(redelivered, Some(DeliveryResult::Completed { work_id, .. }) if work_id == id));
    assert_eq!(h.ledger.backlog().await.unwrap().undelivered, 0);

    let next = h.sweep().await;
    assert_eq!(next.counts.no_action, 1);
    assert_eq!(next.health_score, 1.0);
}

#[tokio::test]
async fn unreadable_ledger_skips_keys() {
    let h = harness();
    h.delivered("reply-1", 500).await;
    h.ledger.set_reads_unavailable(true).await;

    let report = h.sweep().await;
    assert_eq!(report.checked(), 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.counts.manual_review, 0);
    assert_eq!(report.health_score, 1.0);

    h.ledger.set_reads_unavailable(false).await;
    let next = h.sweep().await;
    assert_eq!(next.counts.no_action, 1);
    assert_eq!(next.skipped, 0);
}

#[tokio::test]
async fn report_is_kept_when_stall_handling_fails() {
    let config = ReconcileConfig {
        stall_threshold: Duration::from_secs(120),
        ..ReconcileConfig::default()
    };
    let h = harness_with(config);
    h.delivered("reply-1", 500).await;
    h.replica.remove_document("replies", "reply-1").await;
    let stuck = h.submit("reply-2", 700).await;
    h.engine
        .relay()
        .lease_next(&WorkerId::new("crashed"))
        .await
        .unwrap()
        .unwrap();
    h.clock.advance(Duration::from_secs(180));
    h.ledger.fail_next_requeue().await;

    let report = h.sweep().await;
    assert_eq!(report.counts.re_syncable, 1);
    assert_eq!(report.counts.stalled, 1);
    let rewritten = report
        .findings_of(DivergenceClass::ReSyncable)
        .next()
        .unwrap();
    assert_eq!(rewritten.action, RepairAction::Rewritten { version: 1 });
    let stalled = report
        .findings_of(DivergenceClass::Stalled)
        .next()
        .unwrap();
    assert_eq!(stalled.work_id, stuck);
    assert!(matches!(stalled.action, RepairAction::RepairFailed { .. }));

    let stored = h.engine.recent_reports(10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].run_id, report.run_id);
    assert_eq!(h.ledger.get_work_item(stuck).await.unwrap().status, Status::Processing);

    let retry = h.sweep().await;
    let requeued = retry
        .findings_of(DivergenceClass::Stalled)
        .next()
        .unwrap();
    assert_eq!(requeued.action, RepairAction::Requeued);
}
