//! Ledger port: the authoritative relational store.
//!
//! Every method is one atomic unit against the ledger. Methods that change
//! a leased work item are compare-and-set operations guarded by the
//! caller's lease and fail with [`Error::LeaseLost`](crate::error::Error)
//! when the caller no longer holds it.
//!
//! Two implementations: [`crate::db::Db`] (Postgres) and [`MemoryLedger`].

pub mod memory;

pub use memory::MemoryLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::lease::{LeaseClaim, WorkerId};
use crate::model::idempotency::{IdempotencyKey, KeyClaim, RecordedOutcome};
use crate::model::outbox::{Aggregate, CommitOutcome, CommitRequest, OutboxId, OutboxRecord};
use crate::model::report::ReconciliationReport;
use crate::model::work::{IngestResult, NewWorkItem, WorkId, WorkItem};

/// Last state this service knows it wrote to the replica for a business key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBaseline {
    pub business_key: String,
    /// Content hash of the owned fields as written.
    pub synced_hash: String,
    pub synced_version: u64,
    pub synced_at: DateTime<Utc>,
}

/// Undelivered outbox depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backlog {
    pub undelivered: u64,
    pub oldest_created_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    // -- ingestion -----------------------------------------------------------

    /// Create a work item in `received`, deduplicated by source event id.
    async fn insert_work_item(&self, new: NewWorkItem, now: DateTime<Utc>) -> Result<IngestResult>;

    async fn get_work_item(&self, id: WorkId) -> Result<WorkItem>;

    // -- outbox --------------------------------------------------------------

    /// In one transaction: merge the mutation into the aggregate, write the
    /// outbox record (if there is a downstream effect), link it to the work
    /// item and move the item out of `received`.
    async fn commit_mutation(&self, request: CommitRequest, now: DateTime<Utc>) -> Result<CommitOutcome>;

    async fn get_outbox_record(&self, id: OutboxId) -> Result<OutboxRecord>;

    /// All outbox records written for a work item.
    async fn outbox_for_work(&self, id: WorkId) -> Result<Vec<OutboxRecord>>;

    async fn get_aggregate(&self, business_key: &str) -> Result<Option<Aggregate>>;

    /// Increment and return the delivery attempt counter.
    async fn record_delivery_attempt(&self, id: OutboxId) -> Result<u32>;

    async fn backlog(&self) -> Result<Backlog>;

    // -- leasing -------------------------------------------------------------

    /// Items leasable at `now`, oldest first. Advisory: the lease CAS decides.
    async fn leasable_candidates(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkId>>;

    /// Compare-and-set the lease on `id`. `None` if the item is not
    /// leasable any more (someone else got it, or it changed state).
    async fn try_acquire_lease(&self, id: WorkId, claim: &LeaseClaim) -> Result<Option<WorkItem>>;

    /// `processing → completed`, mark the outbox record delivered and
    /// advance the sync baseline (never backwards).
    async fn complete_work(
        &self,
        id: WorkId,
        owner: &WorkerId,
        baseline: SyncBaseline,
        now: DateTime<Utc>,
    ) -> Result<WorkItem>;

    /// `processing → queued` with backoff, lease cleared.
    async fn schedule_retry(
        &self,
        id: WorkId,
        owner: &WorkerId,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkItem>;

    /// `processing → failed`, lease cleared.
    async fn fail_work(
        &self,
        id: WorkId,
        owner: &WorkerId,
        retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkItem>;

    /// Operator override: back to `queued`, lease and backoff cleared,
    /// `retry_count` incremented. Allowed whatever the current lease.
    async fn reset_to_queued(&self, id: WorkId, now: DateTime<Utc>) -> Result<WorkItem>;

    // -- idempotency ---------------------------------------------------------

    /// Take a hold on `key` before executing its effect.
    async fn claim_idempotency_key(&self, key: &IdempotencyKey, claim: &LeaseClaim) -> Result<KeyClaim>;

    /// Record the outcome of an executed effect. The first recorded outcome
    /// wins; the stored one is returned.
    async fn settle_idempotency_key(
        &self,
        key: &IdempotencyKey,
        owner: &WorkerId,
        outcome: RecordedOutcome,
        now: DateTime<Utc>,
    ) -> Result<RecordedOutcome>;

    /// Drop an unsettled hold so the effect can be retried.
    async fn release_idempotency_key(&self, key: &IdempotencyKey, owner: &WorkerId) -> Result<()>;

    // -- reconciliation ------------------------------------------------------

    /// Items that reached `completed` or `failed` in `[start, end)`.
    async fn terminal_in_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<WorkItem>>;

    /// Items in `processing` since before `started_before` without a live lease.
    async fn stalled_candidates(&self, started_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<WorkItem>>;

    /// Clear the lease of a stalled item and re-queue it, counting the stall.
    /// False if the item is no longer stalled.
    async fn requeue_stalled(&self, id: WorkId, now: DateTime<Utc>) -> Result<bool>;

    async fn sync_baseline(&self, business_key: &str) -> Result<Option<SyncBaseline>>;

    /// Advance the baseline for a business key; older versions are ignored.
    async fn record_sync_baseline(&self, baseline: SyncBaseline) -> Result<()>;

    /// Append a report. Reports are never updated.
    async fn append_report(&self, report: &ReconciliationReport) -> Result<()>;

    async fn get_report(&self, run_id: Uuid) -> Result<ReconciliationReport>;

    /// Most recent reports first.
    async fn list_reports(&self, limit: usize) -> Result<Vec<ReconciliationReport>>;
}
