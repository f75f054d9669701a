//! In-memory ledger.
//!
//! All state lives behind one `tokio::sync::Mutex`, so each trait method is
//! a serializable transaction. Used by tests and for running the relay
//! without Postgres.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Map;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Backlog, Ledger, SyncBaseline};
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseClaim, WorkerId, work_is_leasable};
use crate::model::idempotency::{IdempotencyKey, IdempotencyRecord, KeyClaim, RecordedOutcome};
use crate::model::outbox::{
    Aggregate, CommitOutcome, CommitRequest, DeliveryPayload, OutboxId, OutboxRecord,
};
use crate::model::report::ReconciliationReport;
use crate::model::work::{IngestResult, NewWorkItem, Status, WorkId, WorkItem};

#[derive(Default)]
struct LedgerState {
    work: HashMap<WorkId, WorkItem>,
    by_source_event: HashMap<String, WorkId>,
    outbox: HashMap<OutboxId, OutboxRecord>,
    aggregates: HashMap<String, Aggregate>,
    keys: HashMap<IdempotencyKey, IdempotencyRecord>,
    baselines: HashMap<String, SyncBaseline>,
    reports: Vec<ReconciliationReport>,
    /// Abort the next commit after staging it.
    fail_next_commit: bool,
    /// Outbox and aggregate reads time out while set.
    reads_unavailable: bool,
    fail_next_requeue: bool,
}

fn unavailable() -> Error {
    Error::Storage(sqlx::Error::PoolTimedOut)
}

impl LedgerState {
    fn work(&self, id: WorkId) -> Result<&WorkItem> {
        self.work
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("work item {id}")))
    }

    fn work_mut(&mut self, id: WorkId) -> Result<&mut WorkItem> {
        self.work
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("work item {id}")))
    }

    /// The item, provided `owner` holds its lease.
    fn leased_mut(&mut self, id: WorkId, owner: &WorkerId) -> Result<&mut WorkItem> {
        let item = self.work_mut(id)?;
        let held = item.status == Status::Processing
            && item.lease_owner.as_deref() == Some(owner.as_str());
        if !held {
            return Err(Error::LeaseLost(id));
        }
        Ok(item)
    }

    fn advance_baseline(&mut self, baseline: SyncBaseline) {
        match self.baselines.get(&baseline.business_key) {
            Some(existing) if existing.synced_version > baseline.synced_version => {}
            _ => {
                self.baselines
                    .insert(baseline.business_key.clone(), baseline);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `commit_mutation` fail after staging all of its writes.
    pub async fn fail_next_commit(&self) {
        self.state.lock().await.fail_next_commit = true;
    }

    /// Make outbox record and aggregate reads fail as if the pool were
    /// exhausted, until cleared.
    pub async fn set_reads_unavailable(&self, unavailable: bool) {
        self.state.lock().await.reads_unavailable = unavailable;
    }

    /// Make the next `requeue_stalled` fail.
    pub async fn fail_next_requeue(&self) {
        self.state.lock().await.fail_next_requeue = true;
    }

    pub async fn idempotency_record(&self, key: &IdempotencyKey) -> Option<IdempotencyRecord> {
        self.state.lock().await.keys.get(key).cloned()
    }

    /// Every outbox record, for audits and tests.
    pub async fn all_outbox_records(&self) -> Vec<OutboxRecord> {
        let mut records: Vec<_> = self.state.lock().await.outbox.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }
}

fn clear_lease(item: &mut WorkItem) {
    item.lease_owner = None;
    item.lease_expires_at = None;
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert_work_item(&self, new: NewWorkItem, now: DateTime<Utc>) -> Result<IngestResult> {
        let mut state = self.state.lock().await;

        if let Some(source) = new.source_event_id.as_ref() {
            if let Some(existing) = state.by_source_event.get(source) {
                return Ok(IngestResult::Duplicate {
                    existing: *existing,
                });
            }
        }

        let item = new.into_item(now);
        if let Some(source) = item.source_event_id.clone() {
            state.by_source_event.insert(source, item.id);
        }
        state.work.insert(item.id, item.clone());
        Ok(IngestResult::Created(Box::new(item)))
    }

    async fn get_work_item(&self, id: WorkId) -> Result<WorkItem> {
        self.state.lock().await.work(id).cloned()
    }

    async fn commit_mutation(&self, request: CommitRequest, now: DateTime<Utc>) -> Result<CommitOutcome> {
        let mut state = self.state.lock().await;

        // Stage everything on copies; nothing is visible until the end.
        let mut item = state.work(request.work_id)?.clone();
        if item.status != Status::Received {
            return Err(Error::InvalidTransition {
                from: item.status,
                to: Status::Queued,
            });
        }

        let mut aggregate = state
            .aggregates
            .get(&item.business_key)
            .cloned()
            .unwrap_or_else(|| Aggregate {
                business_key: item.business_key.clone(),
                state: Map::new(),
                version: 0,
                updated_at: now,
            });
        request.mutation.apply_to(&mut aggregate.state);
        aggregate.version += 1;
        aggregate.updated_at = now;

        let outbox = match &request.effect {
            Some(effect) => {
                let payload = DeliveryPayload::project(&aggregate, &effect.collection, &effect.fields);
                Some(OutboxRecord {
                    id: OutboxId::new(),
                    work_id: item.id,
                    aggregate_id: aggregate.business_key.clone(),
                    operation: effect.operation,
                    payload: serde_json::to_value(&payload)?,
                    created_at: now,
                    delivered_at: None,
                    delivery_attempts: 0,
                })
            }
            None => None,
        };

        match &outbox {
            Some(record) => {
                item.status = Status::Queued;
                item.payload_ref = Some(record.id);
            }
            None => {
                item.status = Status::NotApplicable;
                item.completed_at = Some(now);
            }
        }
        item.updated_at = now;

        if std::mem::take(&mut state.fail_next_commit) {
            return Err(Error::Other("injected commit failure".to_string()));
        }

        state
            .aggregates
            .insert(aggregate.business_key.clone(), aggregate.clone());
        if let Some(record) = &outbox {
            state.outbox.insert(record.id, record.clone());
        }
        state.work.insert(item.id, item);

        Ok(CommitOutcome { aggregate, outbox })
    }

    async fn get_outbox_record(&self, id: OutboxId) -> Result<OutboxRecord> {
        let state = self.state.lock().await;
        if state.reads_unavailable {
            return Err(unavailable());
        }
        state
            .outbox
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("outbox record {id}")))
    }

    async fn outbox_for_work(&self, id: WorkId) -> Result<Vec<OutboxRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state
            .outbox
            .values()
            .filter(|r| r.work_id == id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn get_aggregate(&self, business_key: &str) -> Result<Option<Aggregate>> {
        let state = self.state.lock().await;
        if state.reads_unavailable {
            return Err(unavailable());
        }
        Ok(state.aggregates.get(business_key).cloned())
    }

    async fn record_delivery_attempt(&self, id: OutboxId) -> Result<u32> {
        let mut state = self.state.lock().await;
        let record = state
            .outbox
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("outbox record {id}")))?;
        record.delivery_attempts += 1;
        Ok(record.delivery_attempts)
    }

    async fn backlog(&self) -> Result<Backlog> {
        let state = self.state.lock().await;
        let pending = state.outbox.values().filter(|r| r.delivered_at.is_none());
        let mut backlog = Backlog::default();
        for record in pending {
            backlog.undelivered += 1;
            backlog.oldest_created_at = Some(match backlog.oldest_created_at {
                Some(oldest) => oldest.min(record.created_at),
                None => record.created_at,
            });
        }
        Ok(backlog)
    }

    async fn leasable_candidates(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkId>> {
        let state = self.state.lock().await;
        let mut candidates: Vec<&WorkItem> = state
            .work
            .values()
            .filter(|i| work_is_leasable(i.status, i.lease().as_ref(), i.next_attempt_at, now))
            .collect();
        candidates.sort_by_key(|i| (i.created_at, i.id));
        Ok(candidates.into_iter().take(limit).map(|i| i.id).collect())
    }

    async fn try_acquire_lease(&self, id: WorkId, claim: &LeaseClaim) -> Result<Option<WorkItem>> {
        let mut state = self.state.lock().await;
        let item = state.work_mut(id)?;

        let current = item.lease();
        if !work_is_leasable(item.status, current.as_ref(), item.next_attempt_at, claim.now)
            || !claim.can_replace(current.as_ref())
        {
            return Ok(None);
        }

        let lease = Lease {
            owner: claim.owner.clone(),
            expires_at: claim.expires_at,
        };
        item.status = Status::Processing;
        item.lease_owner = Some(lease.owner.to_string());
        item.lease_expires_at = Some(lease.expires_at);
        item.next_attempt_at = None;
        item.started_at = Some(claim.now);
        item.updated_at = claim.now;
        Ok(Some(item.clone()))
    }

    async fn complete_work(
        &self,
        id: WorkId,
        owner: &WorkerId,
        baseline: SyncBaseline,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let mut state = self.state.lock().await;
        let item = state.leased_mut(id, owner)?;
        item.status = Status::Completed;
        item.completed_at = Some(now);
        item.updated_at = now;
        item.last_error = None;
        clear_lease(item);
        let item = item.clone();

        if let Some(outbox_id) = item.payload_ref {
            if let Some(record) = state.outbox.get_mut(&outbox_id) {
                record.delivered_at.get_or_insert(now);
            }
        }
        state.advance_baseline(baseline);
        Ok(item)
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
        let mut state = self.state.lock().await;
        let item = state.leased_mut(id, owner)?;
        item.status = Status::Queued;
        item.retry_count = retry_count;
        item.next_attempt_at = Some(next_attempt_at);
        item.last_error = Some(error.to_string());
        item.updated_at = now;
        clear_lease(item);
        Ok(item.clone())
    }

    async fn fail_work(
        &self,
        id: WorkId,
        owner: &WorkerId,
        retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let mut state = self.state.lock().await;
        let item = state.leased_mut(id, owner)?;
        item.status = Status::Failed;
        item.retry_count = retry_count;
        item.last_error = Some(error.to_string());
        item.completed_at = Some(now);
        item.updated_at = now;
        clear_lease(item);
        Ok(item.clone())
    }

    async fn reset_to_queued(&self, id: WorkId, now: DateTime<Utc>) -> Result<WorkItem> {
        let mut state = self.state.lock().await;
        let item = state.work_mut(id)?;
        if !item.status.can_transition_to(Status::Queued) || item.payload_ref.is_none() {
            return Err(Error::InvalidTransition {
                from: item.status,
                to: Status::Queued,
            });
        }
        item.status = Status::Queued;
        item.retry_count += 1;
        item.next_attempt_at = None;
        item.completed_at = None;
        item.updated_at = now;
        clear_lease(item);
        Ok(item.clone())
    }

    async fn claim_idempotency_key(&self, key: &IdempotencyKey, claim: &LeaseClaim) -> Result<KeyClaim> {
        let mut state = self.state.lock().await;
        let record = state
            .keys
            .entry(key.clone())
            .or_insert_with(|| IdempotencyRecord {
                key: key.clone(),
                first_seen_at: claim.now,
                outcome: None,
                holder: None,
                hold_expires_at: None,
            });

        if let Some(outcome) = &record.outcome {
            return Ok(KeyClaim::Settled(outcome.clone()));
        }

        let current = match (&record.holder, record.hold_expires_at) {
            (Some(holder), Some(expires_at)) => Some(Lease {
                owner: holder.as_str().into(),
                expires_at,
            }),
            _ => None,
        };
        if !claim.can_replace(current.as_ref()) {
            return Ok(KeyClaim::Busy {
                holder: record.holder.clone().unwrap_or_default(),
            });
        }

        record.holder = Some(claim.owner.to_string());
        record.hold_expires_at = Some(claim.expires_at);
        Ok(KeyClaim::Acquired)
    }

    async fn settle_idempotency_key(
        &self,
        key: &IdempotencyKey,
        _owner: &WorkerId,
        outcome: RecordedOutcome,
        now: DateTime<Utc>,
    ) -> Result<RecordedOutcome> {
        let mut state = self.state.lock().await;
        let record = state
            .keys
            .entry(key.clone())
            .or_insert_with(|| IdempotencyRecord {
                key: key.clone(),
                first_seen_at: now,
                outcome: None,
                holder: None,
                hold_expires_at: None,
            });
        let stored = record.outcome.get_or_insert(outcome).clone();
        record.holder = None;
        record.hold_expires_at = None;
        Ok(stored)
    }

    async fn release_idempotency_key(&self, key: &IdempotencyKey, owner: &WorkerId) -> Result<()> {
        let mut state = self.state.lock().await;
        let releasable = state.keys.get(key).is_some_and(|r| {
            r.outcome.is_none() && r.holder.as_deref() == Some(owner.as_str())
        });
        if releasable {
            state.keys.remove(key);
        }
        Ok(())
    }

    async fn terminal_in_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<WorkItem>> {
        let state = self.state.lock().await;
        let mut items: Vec<_> = state
            .work
            .values()
            .filter(|i| matches!(i.status, Status::Completed | Status::Failed))
            .filter(|i| i.completed_at.is_some_and(|t| t >= start && t < end))
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.completed_at, i.id));
        Ok(items)
    }

    async fn stalled_candidates(&self, started_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<WorkItem>> {
        let state = self.state.lock().await;
        let mut items: Vec<_> = state
            .work
            .values()
            .filter(|i| i.status == Status::Processing)
            .filter(|i| i.started_at.is_some_and(|t| t < started_before))
            .filter(|i| !i.has_live_lease(now))
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.started_at, i.id));
        Ok(items)
    }

    async fn requeue_stalled(&self, id: WorkId, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        if std::mem::take(&mut state.fail_next_requeue) {
            return Err(unavailable());
        }
        let item = state.work_mut(id)?;
        if item.status != Status::Processing || item.has_live_lease(now) {
            return Ok(false);
        }
        item.status = Status::Queued;
        item.stall_count += 1;
        item.next_attempt_at = None;
        item.updated_at = now;
        clear_lease(item);
        Ok(true)
    }

    async fn sync_baseline(&self, business_key: &str) -> Result<Option<SyncBaseline>> {
        Ok(self.state.lock().await.baselines.get(business_key).cloned())
    }

    async fn record_sync_baseline(&self, baseline: SyncBaseline) -> Result<()> {
        self.state.lock().await.advance_baseline(baseline);
        Ok(())
    }

    async fn append_report(&self, report: &ReconciliationReport) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.reports.iter().any(|r| r.run_id == report.run_id) {
            return Err(Error::Other(format!(
                "reconciliation report {} already exists",
                report.run_id
            )));
        }
        state.reports.push(report.clone());
        Ok(())
    }

    async fn get_report(&self, run_id: Uuid) -> Result<ReconciliationReport> {
        self.state
            .lock()
            .await
            .reports
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("reconciliation report {run_id}")))
    }

    async fn list_reports(&self, limit: usize) -> Result<Vec<ReconciliationReport>> {
        let state = self.state.lock().await;
        Ok(state.reports.iter().rev().take(limit).cloned().collect())
    }
}
