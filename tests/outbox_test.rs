//! Outbox writer: mutation and outbox record commit together or not at all.

use std::sync::Arc;

use ledgersync::clock::ManualClock;
use ledgersync::engine::{Engine, Submitted};
use ledgersync::error::Error;
use ledgersync::ledger::{Ledger, MemoryLedger};
use ledgersync::model::outbox::{DeliveryPayload, LedgerMutation, OperationKind};
use ledgersync::model::work::{IngestResult, NewWorkItem, Status};
use ledgersync::replica::{FieldOwnership, MemoryReplica};
use serde_json::json;

fn engine(ledger: &Arc<MemoryLedger>) -> Engine {
    Engine::builder(
        ledger.clone(),
        Arc::new(MemoryReplica::new()),
        FieldOwnership::new("ledgersync", 1, ["amount", "creditor"]),
    )
    .collection("replies")
    .clock(Arc::new(ManualClock::default()))
    .build()
    .unwrap()
}

fn reply_mutation() -> LedgerMutation {
    LedgerMutation::new()
        .set("amount", 500)
        .set("creditor", "ACME")
        .set("internal_note", "ledger only")
}

#[tokio::test]
async fn commit_writes_exactly_one_outbox_record() {
    let ledger = Arc::new(MemoryLedger::new());
    let engine = engine(&ledger);

    let submitted = engine
        .submit(NewWorkItem::new("reply-1"), reply_mutation())
        .await
        .unwrap();
    let Submitted::Committed { work_id, outcome } = submitted else {
        panic!("expected a committed submission");
    };

    let records = ledger.all_outbox_records().await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.work_id, work_id);
    assert_eq!(record.operation, OperationKind::Upsert);
    assert_eq!(record.delivery_attempts, 0);
    assert!(record.delivered_at.is_none());

    let payload = DeliveryPayload::from_value(&record.payload).unwrap();
    assert_eq!(payload.collection, "replies");
    assert_eq!(payload.version, 1);
    assert_eq!(payload.fields.get("amount"), Some(&json!(500)));
    assert!(!payload.fields.contains_key("internal_note"));

    let item = ledger.get_work_item(work_id).await.unwrap();
    assert_eq!(item.status, Status::Queued);
    assert_eq!(item.payload_ref, Some(record.id));
    assert_eq!(outcome.aggregate.version, 1);
}

#[tokio::test]
async fn failed_commit_leaves_no_trace() {
    let ledger = Arc::new(MemoryLedger::new());
    let engine = engine(&ledger);

    let created = engine.ingest(NewWorkItem::new("reply-1")).await.unwrap();
    let work_id = created.work_id();

    ledger.fail_next_commit().await;
    let result = engine
        .commit(work_id, reply_mutation(), Some(engine.replica_effect()))
        .await;
    assert!(result.is_err());

    assert!(ledger.get_aggregate("reply-1").await.unwrap().is_none());
    assert!(ledger.all_outbox_records().await.is_empty());
    let item = ledger.get_work_item(work_id).await.unwrap();
    assert_eq!(item.status, Status::Received);
    assert!(item.payload_ref.is_none());

    // The item can still be committed once the ledger recovers.
    engine
        .commit(work_id, reply_mutation(), Some(engine.replica_effect()))
        .await
        .unwrap();
    assert_eq!(ledger.all_outbox_records().await.len(), 1);
}

#[tokio::test]
async fn mutation_without_effect_is_not_applicable() {
    let ledger = Arc::new(MemoryLedger::new());
    let engine = engine(&ledger);

    let work_id = engine
        .ingest(NewWorkItem::new("reply-1"))
        .await
        .unwrap()
        .work_id();
    let outcome = engine
        .commit(work_id, LedgerMutation::new().set("internal_note", "x"), None)
        .await
        .unwrap();

    assert!(outcome.outbox.is_none());
    assert!(ledger.all_outbox_records().await.is_empty());
    let item = ledger.get_work_item(work_id).await.unwrap();
    assert_eq!(item.status, Status::NotApplicable);
    assert!(item.status.is_terminal());
}

#[tokio::test]
async fn duplicate_source_event_is_ingested_once() {
    let ledger = Arc::new(MemoryLedger::new());
    let engine = engine(&ledger);

    let first = engine
        .submit(
            NewWorkItem::new("reply-1").source_event_id("evt-42"),
            reply_mutation(),
        )
        .await
        .unwrap();
    let Submitted::Committed { work_id, .. } = first else {
        panic!("first submission should commit");
    };

    let second = engine
        .submit(
            NewWorkItem::new("reply-1").source_event_id("evt-42"),
            reply_mutation(),
        )
        .await
        .unwrap();
    match second {
        Submitted::Duplicate { existing } => assert_eq!(existing, work_id),
        other => panic!("expected duplicate, got {other:?}"),
    }

    assert_eq!(ledger.all_outbox_records().await.len(), 1);
    let aggregate = ledger.get_aggregate("reply-1").await.unwrap().unwrap();
    assert_eq!(aggregate.version, 1);
}

#[tokio::test]
async fn committed_item_cannot_be_committed_again() {
    let ledger = Arc::new(MemoryLedger::new());
    let engine = engine(&ledger);

    let IngestResult::Created(item) = engine.ingest(NewWorkItem::new("reply-1")).await.unwrap()
    else {
        panic!("expected a new item");
    };
    engine
        .commit(item.id, reply_mutation(), Some(engine.replica_effect()))
        .await
        .unwrap();

    let again = engine
        .commit(item.id, reply_mutation(), Some(engine.replica_effect()))
        .await;
    assert!(matches!(
        again,
        Err(Error::InvalidTransition {
            from: Status::Queued,
            ..
        })
    ));
    assert_eq!(ledger.all_outbox_records().await.len(), 1);
}

#[tokio::test]
async fn later_mutations_bump_the_aggregate_version() {
    let ledger = Arc::new(MemoryLedger::new());
    let engine = engine(&ledger);

    engine
        .submit(NewWorkItem::new("reply-1"), reply_mutation())
        .await
        .unwrap();
    engine
        .submit(
            NewWorkItem::new("reply-1"),
            LedgerMutation::new().set("amount", 450),
        )
        .await
        .unwrap();

    let aggregate = ledger.get_aggregate("reply-1").await.unwrap().unwrap();
    assert_eq!(aggregate.version, 2);
    assert_eq!(aggregate.state["amount"], json!(450));
    assert_eq!(aggregate.state["creditor"], json!("ACME"));

    let backlog = ledger.backlog().await.unwrap();
    assert_eq!(backlog.undelivered, 2);
}
