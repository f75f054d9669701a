//! Core engine. The public API for ingesting events and operating the
//! relay and reconciler.
//!
//! The engine wires one ledger and one replica to the outbox writer, the
//! relay and the reconciliation engine. Inbound handlers call
//! [`Engine::submit`] (or [`Engine::ingest`] then [`Engine::commit`]);
//! operational tooling uses [`Engine::status`], [`Engine::reset_to_queued`]
//! and [`Engine::reconcile_now`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::lease::Lease;
use crate::ledger::Ledger;
use crate::model::outbox::{CommitOutcome, DownstreamEffect, LedgerMutation, OperationKind};
use crate::model::report::ReconciliationReport;
use crate::model::work::{IngestResult, NewWorkItem, Status, WorkId, WorkItem};
use crate::notify::{FailureNotifier, TracingNotifier};
use crate::outbox::OutboxWriter;
use crate::reconcile::{ReconcileConfig, ReconcileScheduler, ReconciliationEngine};
use crate::relay::{Relay, RelayConfig, WorkerPool};
use crate::replica::{FieldOwnership, Replica};
use crate::telemetry::metrics;

/// Read-only view of a work item for operational tooling.
#[derive(Debug, Clone, Serialize)]
pub struct WorkStatus {
    pub id: WorkId,
    pub business_key: String,
    pub status: Status,
    pub retry_count: u32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Whether the recorded lease was still live when the view was taken.
    pub lease_live: bool,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub stall_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkStatus {
    fn from_item(item: WorkItem, now: DateTime<Utc>) -> Self {
        let lease_live = item.lease().as_ref().is_some_and(|l: &Lease| l.is_live(now));
        Self {
            id: item.id,
            business_key: item.business_key,
            status: item.status,
            retry_count: item.retry_count,
            lease_owner: item.lease_owner,
            lease_expires_at: item.lease_expires_at,
            lease_live,
            next_attempt_at: item.next_attempt_at,
            stall_count: item.stall_count,
            last_error: item.last_error,
            created_at: item.created_at,
            started_at: item.started_at,
            completed_at: item.completed_at,
            updated_at: item.updated_at,
        }
    }
}

/// Result of [`Engine::submit`].
#[derive(Debug)]
pub enum Submitted {
    /// New work item, mutation committed.
    Committed {
        work_id: WorkId,
        outcome: CommitOutcome,
    },
    /// The source event was already ingested; nothing was committed.
    Duplicate { existing: WorkId },
}

pub struct EngineBuilder {
    ledger: Arc<dyn Ledger>,
    replica: Arc<dyn Replica>,
    ownership: FieldOwnership,
    collection: String,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn FailureNotifier>,
    relay_config: RelayConfig,
    reconcile_config: ReconcileConfig,
}

impl EngineBuilder {
    /// Replica collection outbox records are delivered to.
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn relay_config(mut self, config: RelayConfig) -> Self {
        self.relay_config = config;
        self
    }

    pub fn reconcile_config(mut self, config: ReconcileConfig) -> Self {
        self.reconcile_config = config;
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.relay_config.validate()?;
        self.reconcile_config.validate()?;

        let relay = Relay::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.replica),
            self.ownership.clone(),
            self.relay_config,
        )
        .with_clock(Arc::clone(&self.clock))
        .with_notifier(self.notifier);

        let reconciler = ReconciliationEngine::new(
            Arc::clone(&self.ledger),
            self.replica,
            self.ownership.clone(),
            self.reconcile_config,
        )
        .with_clock(Arc::clone(&self.clock));

        Ok(Engine {
            writer: OutboxWriter::new(Arc::clone(&self.ledger), Arc::clone(&self.clock)),
            ledger: self.ledger,
            ownership: self.ownership,
            collection: self.collection,
            clock: self.clock,
            relay: Arc::new(relay),
            reconciler: Arc::new(reconciler),
        })
    }
}

/// The ledger/replica consistency engine.
pub struct Engine {
    ledger: Arc<dyn Ledger>,
    ownership: FieldOwnership,
    collection: String,
    clock: Arc<dyn Clock>,
    writer: OutboxWriter,
    relay: Arc<Relay>,
    reconciler: Arc<ReconciliationEngine>,
}

impl Engine {
    pub fn builder(
        ledger: Arc<dyn Ledger>,
        replica: Arc<dyn Replica>,
        ownership: FieldOwnership,
    ) -> EngineBuilder {
        EngineBuilder {
            ledger,
            replica,
            ownership,
            collection: "documents".to_string(),
            clock: Arc::new(SystemClock),
            notifier: Arc::new(TracingNotifier),
            relay_config: RelayConfig::default(),
            reconcile_config: ReconcileConfig::default(),
        }
    }

    // -- ingestion -----------------------------------------------------------

    /// Record an inbound event as a `received` work item.
    pub async fn ingest(&self, new: NewWorkItem) -> Result<IngestResult> {
        let result = self.ledger.insert_work_item(new, self.clock.now()).await?;
        let label = match &result {
            IngestResult::Created(item) => {
                tracing::info!(work_id = %item.id, business_key = %item.business_key, "work item received");
                "created"
            }
            IngestResult::Duplicate { existing } => {
                tracing::info!(existing = %existing, "duplicate source event, not ingested");
                "duplicate"
            }
        };
        metrics::work_ingested().add(1, &[KeyValue::new("result", label)]);
        Ok(result)
    }

    /// The usual downstream effect: upsert our owned fields.
    pub fn replica_effect(&self) -> DownstreamEffect {
        DownstreamEffect {
            operation: OperationKind::Upsert,
            collection: self.collection.clone(),
            fields: self.ownership.fields.clone(),
        }
    }

    /// Commit a mutation for a `received` item, with or without an effect.
    pub async fn commit(
        &self,
        work_id: WorkId,
        mutation: LedgerMutation,
        effect: Option<DownstreamEffect>,
    ) -> Result<CommitOutcome> {
        self.writer.commit(work_id, mutation, effect).await
    }

    /// Ingest and commit in one call, mirroring the mutation to the replica.
    pub async fn submit(&self, new: NewWorkItem, mutation: LedgerMutation) -> Result<Submitted> {
        match self.ingest(new).await? {
            IngestResult::Created(item) => {
                let outcome = self
                    .commit(item.id, mutation, Some(self.replica_effect()))
                    .await?;
                Ok(Submitted::Committed {
                    work_id: item.id,
                    outcome,
                })
            }
            IngestResult::Duplicate { existing } => Ok(Submitted::Duplicate { existing }),
        }
    }

    // -- query ---------------------------------------------------------------

    pub async fn status(&self, id: WorkId) -> Result<WorkStatus> {
        let item = self.ledger.get_work_item(id).await?;
        Ok(WorkStatus::from_item(item, self.clock.now()))
    }

    pub async fn report(&self, run_id: Uuid) -> Result<ReconciliationReport> {
        self.ledger.get_report(run_id).await
    }

    pub async fn recent_reports(&self, limit: usize) -> Result<Vec<ReconciliationReport>> {
        self.ledger.list_reports(limit).await
    }

    // -- operational controls ------------------------------------------------

    /// Force an item back to `queued`, whatever lease it holds. Safe while
    /// workers run: the previous holder's outcome CAS will fail.
    pub async fn reset_to_queued(&self, id: WorkId) -> Result<WorkItem> {
        let before = self.ledger.get_work_item(id).await?;
        let item = self.ledger.reset_to_queued(id, self.clock.now()).await?;
        tracing::warn!(
            work_id = %id,
            from = %before.status,
            retry_count = item.retry_count,
            "work item reset to queued by operator"
        );
        metrics::work_state_transitions().add(
            1,
            &[
                KeyValue::new("from", before.status.as_str()),
                KeyValue::new("to", Status::Queued.as_str()),
            ],
        );
        Ok(item)
    }

    /// Run a reconciliation sweep now and return its report.
    pub async fn reconcile_now(&self) -> Result<ReconciliationReport> {
        self.reconciler.sweep().await
    }

    // -- runtime -------------------------------------------------------------

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn reconciler(&self) -> &Arc<ReconciliationEngine> {
        &self.reconciler
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Start `n` relay workers.
    pub fn spawn_workers(&self, n: usize) -> WorkerPool {
        WorkerPool::spawn(n, "relay", Arc::clone(&self.relay))
    }

    /// Start scheduled reconciliation at the configured interval.
    pub fn start_scheduler(&self) -> ReconcileScheduler {
        let interval = self.reconciler.config().interval;
        ReconcileScheduler::start(Arc::clone(&self.reconciler), interval)
    }
}
