//! Postgres ledger: connection pool, migrations, health check, and the
//! [`Ledger`] implementation.
//!
//! Each ledger operation is either one guarded statement or one
//! transaction. Lease and idempotency-hold acquisition are conditional
//! `UPDATE`s / upserts, never `SELECT ... FOR UPDATE SKIP LOCKED`, so the
//! CAS rule is the same one `MemoryLedger` applies.

pub mod idempotency;
pub mod outbox;
pub mod reconcile;
pub mod work;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::error::Result;
use crate::lease::{LeaseClaim, WorkerId};
use crate::ledger::{Backlog, Ledger, SyncBaseline};
use crate::model::idempotency::{IdempotencyKey, KeyClaim, RecordedOutcome};
use crate::model::outbox::{Aggregate, CommitOutcome, CommitRequest, OutboxId, OutboxRecord};
use crate::model::report::ReconciliationReport;
use crate::model::work::{IngestResult, NewWorkItem, WorkId, WorkItem};

/// Database handle. Owns the connection pool.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Ledger for Db {
    async fn insert_work_item(&self, new: NewWorkItem, now: DateTime<Utc>) -> Result<IngestResult> {
        self.insert_work_item(new, now).await
    }

    async fn get_work_item(&self, id: WorkId) -> Result<WorkItem> {
        self.get_work_item(id).await
    }

    async fn commit_mutation(&self, request: CommitRequest, now: DateTime<Utc>) -> Result<CommitOutcome> {
        self.commit_mutation(request, now).await
    }

    async fn get_outbox_record(&self, id: OutboxId) -> Result<OutboxRecord> {
        self.get_outbox_record(id).await
    }

    async fn outbox_for_work(&self, id: WorkId) -> Result<Vec<OutboxRecord>> {
        self.outbox_for_work(id).await
    }

    async fn get_aggregate(&self, business_key: &str) -> Result<Option<Aggregate>> {
        self.get_aggregate(business_key).await
    }

    async fn record_delivery_attempt(&self, id: OutboxId) -> Result<u32> {
        self.record_delivery_attempt(id).await
    }

    async fn backlog(&self) -> Result<Backlog> {
        self.backlog().await
    }

    async fn leasable_candidates(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkId>> {
        self.leasable_candidates(now, limit).await
    }

    async fn try_acquire_lease(&self, id: WorkId, claim: &LeaseClaim) -> Result<Option<WorkItem>> {
        self.try_acquire_lease(id, claim).await
    }

    async fn complete_work(
        &self,
        id: WorkId,
        owner: &WorkerId,
        baseline: SyncBaseline,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        self.complete_work(id, owner, baseline, now).await
    }

    async fn schedule_retry(
        &self,
        id: WorkId,
        owner: &WorkerId,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        self.schedule_retry(id, owner, retry_count, next_attempt_at, error, now)
            .await
    }

    async fn fail_work(
        &self,
        id: WorkId,
        owner: &WorkerId,
        retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        self.fail_work(id, owner, retry_count, error, now).await
    }

    async fn reset_to_queued(&self, id: WorkId, now: DateTime<Utc>) -> Result<WorkItem> {
        self.reset_to_queued(id, now).await
    }

    async fn claim_idempotency_key(&self, key: &IdempotencyKey, claim: &LeaseClaim) -> Result<KeyClaim> {
        self.claim_idempotency_key(key, claim).await
    }

    async fn settle_idempotency_key(
        &self,
        key: &IdempotencyKey,
        owner: &WorkerId,
        outcome: RecordedOutcome,
        now: DateTime<Utc>,
    ) -> Result<RecordedOutcome> {
        self.settle_idempotency_key(key, owner, outcome, now).await
    }

    async fn release_idempotency_key(&self, key: &IdempotencyKey, owner: &WorkerId) -> Result<()> {
        self.release_idempotency_key(key, owner).await
    }

    async fn terminal_in_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<WorkItem>> {
        self.terminal_in_window(start, end).await
    }

    async fn stalled_candidates(&self, started_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<WorkItem>> {
        self.stalled_candidates(started_before, now).await
    }

    async fn requeue_stalled(&self, id: WorkId, now: DateTime<Utc>) -> Result<bool> {
        self.requeue_stalled(id, now).await
    }

    async fn sync_baseline(&self, business_key: &str) -> Result<Option<SyncBaseline>> {
        self.sync_baseline(business_key).await
    }

    async fn record_sync_baseline(&self, baseline: SyncBaseline) -> Result<()> {
        self.record_sync_baseline(baseline).await
    }

    async fn append_report(&self, report: &ReconciliationReport) -> Result<()> {
        self.append_report(report).await
    }

    async fn get_report(&self, run_id: Uuid) -> Result<ReconciliationReport> {
        self.get_report(run_id).await
    }

    async fn list_reports(&self, limit: usize) -> Result<Vec<ReconciliationReport>> {
        self.list_reports(limit).await
    }
}
