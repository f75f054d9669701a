//! Job state machine and relay.
//!
//! A worker leases a `queued` work item with a compare-and-set on
//! `(lease_owner, lease_expires_at)`, skipping items someone else got
//! first, then delivers the item's outbox record to the replica through
//! the idempotency guard. Each outcome is committed with a CAS guarded by
//! the worker's lease:
//!
//! - success: `processing → completed`, outbox record marked delivered
//! - transient failure: `processing → queued` with exponential backoff,
//!   or `failed` once the retry budget is spent
//! - permanent failure: `processing → failed`, notifier called once
//!
//! A worker that dies mid-delivery holds nothing once its lease expires;
//! the item is then leasable again and the guard keeps the replica write
//! from being applied twice.

pub mod pool;
pub mod retry;

pub use pool::WorkerPool;
pub use retry::RetryPolicy;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::watch;
use tracing::Instrument as _;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::idempotency::{Applied, GuardError, IdempotencyGuard, content_hash};
use crate::lease::{LeaseClaim, WorkerId};
use crate::ledger::{Ledger, SyncBaseline};
use crate::model::idempotency::RecordedOutcome;
use crate::model::outbox::{DeliveryPayload, OutboxRecord};
use crate::model::work::{Status, WorkId, WorkItem};
use crate::notify::{FailureKind, FailureNotice, FailureNotifier, TracingNotifier};
use crate::replica::{FieldOwnership, OwnedWrite, Replica, ReplicaError};
use crate::telemetry::{metrics, work as spans};

/// Relay tunables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Lease duration. Bounds how long a crashed worker blocks an item.
    pub lease_ttl: Duration,
    /// Sleep between polls when nothing is leasable.
    pub poll_interval: Duration,
    /// Upper bound on a single replica write.
    pub attempt_timeout: Duration,
    /// Candidates fetched per poll before trying the lease CAS on each.
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(10),
            batch_size: 16,
            retry: RetryPolicy::default(),
        }
    }
}

impl RelayConfig {
    /// An attempt must finish inside its lease.
    pub fn validate(&self) -> Result<()> {
        if self.attempt_timeout >= self.lease_ttl {
            return Err(Error::Config(format!(
                "attempt timeout ({:?}) must be shorter than the lease ({:?})",
                self.attempt_timeout, self.lease_ttl
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("relay batch size must be positive".to_string()));
        }
        if self.retry.floor > self.retry.cap {
            return Err(Error::Config(
                "backoff floor must not exceed the backoff cap".to_string(),
            ));
        }
        Ok(())
    }
}

/// What one delivery attempt ended in.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryResult {
    /// Replica write applied; `cached` when the guard had already seen it.
    Completed { work_id: WorkId, cached: bool },
    /// Transient failure, re-queued with backoff.
    Retrying {
        work_id: WorkId,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Terminal failure; the notifier has been called.
    Failed { work_id: WorkId, kind: FailureKind },
    /// Our lease was taken over before we could record the outcome.
    LeaseLost { work_id: WorkId },
}

impl DeliveryResult {
    pub fn work_id(&self) -> WorkId {
        match self {
            DeliveryResult::Completed { work_id, .. }
            | DeliveryResult::Retrying { work_id, .. }
            | DeliveryResult::Failed { work_id, .. }
            | DeliveryResult::LeaseLost { work_id } => *work_id,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            DeliveryResult::Completed { cached: false, .. } => "completed",
            DeliveryResult::Completed { cached: true, .. } => "cached",
            DeliveryResult::Retrying { .. } => "retry",
            DeliveryResult::Failed { .. } => "failed",
            DeliveryResult::LeaseLost { .. } => "lease_lost",
        }
    }
}

/// Delivers outbox records to the replica.
pub struct Relay {
    ledger: Arc<dyn Ledger>,
    replica: Arc<dyn Replica>,
    ownership: FieldOwnership,
    notifier: Arc<dyn FailureNotifier>,
    clock: Arc<dyn Clock>,
    guard: IdempotencyGuard,
    config: RelayConfig,
}

impl Relay {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        replica: Arc<dyn Replica>,
        ownership: FieldOwnership,
        config: RelayConfig,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let guard = IdempotencyGuard::new(Arc::clone(&ledger), Arc::clone(&clock), config.lease_ttl);
        Self {
            ledger,
            replica,
            ownership,
            notifier: Arc::new(TracingNotifier),
            clock,
            guard,
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.guard = IdempotencyGuard::new(
            Arc::clone(&self.ledger),
            Arc::clone(&clock),
            self.config.lease_ttl,
        );
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Lease the oldest leasable item, skipping any we lose the CAS on.
    pub async fn lease_next(&self, worker: &WorkerId) -> Result<Option<WorkItem>> {
        let now = self.clock.now();
        let candidates = self
            .ledger
            .leasable_candidates(now, self.config.batch_size)
            .await?;

        let claim = LeaseClaim::new(worker.clone(), now, self.config.lease_ttl);
        for id in candidates {
            match self.ledger.try_acquire_lease(id, &claim).await? {
                Some(item) => {
                    metrics::lease_acquisitions().add(1, &[KeyValue::new("result", "acquired")]);
                    tracing::debug!(work_id = %id, worker = %worker, "lease acquired");
                    return Ok(Some(item));
                }
                None => {
                    metrics::lease_acquisitions().add(1, &[KeyValue::new("result", "contended")]);
                    tracing::debug!(work_id = %id, worker = %worker, "lease contended, skipping");
                }
            }
        }
        Ok(None)
    }

    /// Lease and deliver at most one item. `None` when nothing was leasable.
    pub async fn poll_once(&self, worker: &WorkerId) -> Result<Option<DeliveryResult>> {
        let Some(item) = self.lease_next(worker).await? else {
            return Ok(None);
        };
        self.deliver(worker, item).await.map(Some)
    }

    /// Deliver a leased item and commit the outcome under `worker`'s lease.
    pub async fn deliver(&self, worker: &WorkerId, item: WorkItem) -> Result<DeliveryResult> {
        let span = spans::start_delivery_span(worker, item.id, &item.business_key);
        spans::record_state_transition(&span, Status::Queued, Status::Processing);
        let start = Instant::now();

        let result = self.attempt(worker, &item).instrument(span.clone()).await?;

        match &result {
            DeliveryResult::Completed { .. } => {
                spans::record_state_transition(&span, Status::Processing, Status::Completed)
            }
            DeliveryResult::Retrying { .. } => {
                spans::record_state_transition(&span, Status::Processing, Status::Queued)
            }
            DeliveryResult::Failed { .. } => {
                spans::record_state_transition(&span, Status::Processing, Status::Failed)
            }
            DeliveryResult::LeaseLost { .. } => {}
        }
        metrics::delivery_attempts().add(1, &[KeyValue::new("result", result.label())]);
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "deliver")],
        );
        Ok(result)
    }

    async fn attempt(&self, worker: &WorkerId, item: &WorkItem) -> Result<DeliveryResult> {
        let Some(outbox_id) = item.payload_ref else {
            return self
                .fail(worker, item, FailureKind::Permanent, "work item has no outbox record")
                .await;
        };
        let record = self.ledger.get_outbox_record(outbox_id).await?;
        let attempt = self.ledger.record_delivery_attempt(record.id).await?;
        tracing::debug!(outbox_id = %record.id, attempt, "delivering outbox record");

        let payload = match DeliveryPayload::from_value(&record.payload) {
            Ok(payload) => payload,
            Err(reason) => return self.fail(worker, item, FailureKind::Permanent, &reason).await,
        };

        match self.write_through_guard(worker, &record, payload).await {
            Ok(applied) => {
                let cached = applied.was_cached();
                match applied.outcome().clone() {
                    RecordedOutcome::Applied {
                        version,
                        content_hash,
                        written,
                    } => {
                        if !written {
                            tracing::info!(
                                version,
                                "replica already holds a newer version, write skipped"
                            );
                        }
                        let baseline = SyncBaseline {
                            business_key: item.business_key.clone(),
                            synced_hash: content_hash,
                            synced_version: version,
                            synced_at: self.clock.now(),
                        };
                        self.complete(worker, item, baseline, cached).await
                    }
                    RecordedOutcome::Rejected { reason } => {
                        self.fail(worker, item, FailureKind::Permanent, &reason).await
                    }
                }
            }
            Err(GuardError::Ledger(e)) => Err(e),
            Err(e) => self.retry(worker, item, &e.to_string()).await,
        }
    }

    async fn write_through_guard(
        &self,
        worker: &WorkerId,
        record: &OutboxRecord,
        payload: DeliveryPayload,
    ) -> std::result::Result<Applied, GuardError> {
        let replica = Arc::clone(&self.replica);
        let ownership = self.ownership.clone();
        let timeout = self.config.attempt_timeout;
        let written_at = self.clock.now();

        self.guard
            .apply(
                worker,
                record.operation,
                &record.aggregate_id,
                &record.payload,
                move |key| async move {
                    let hash = content_hash(&serde_json::Value::Object(payload.fields.clone()));
                    let version = payload.version;
                    let write = OwnedWrite {
                        ownership,
                        payload,
                        idempotency_key: key,
                        written_at,
                    };
                    let ack = tokio::time::timeout(timeout, replica.upsert_owned(&write))
                        .await
                        .map_err(|_| ReplicaError::Timeout)??;
                    Ok(RecordedOutcome::Applied {
                        version,
                        content_hash: hash,
                        written: ack.written,
                    })
                },
            )
            .await
    }

    async fn complete(
        &self,
        worker: &WorkerId,
        item: &WorkItem,
        baseline: SyncBaseline,
        cached: bool,
    ) -> Result<DeliveryResult> {
        let outcome = self
            .ledger
            .complete_work(item.id, worker, baseline, self.clock.now())
            .await;
        match lease_checked(item.id, outcome)? {
            Some(_) => {
                tracing::info!(cached, retry_count = item.retry_count, "delivered");
                Ok(DeliveryResult::Completed {
                    work_id: item.id,
                    cached,
                })
            }
            None => Ok(DeliveryResult::LeaseLost { work_id: item.id }),
        }
    }

    async fn retry(&self, worker: &WorkerId, item: &WorkItem, error: &str) -> Result<DeliveryResult> {
        let retry_count = item.retry_count + 1;
        let policy = &self.config.retry;
        if policy.is_exhausted(retry_count) {
            return self
                .fail_with_count(worker, item, FailureKind::Exhausted, error, retry_count)
                .await;
        }

        let now = self.clock.now();
        let delay = policy.next_delay(retry_count);
        let next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let outcome = self
            .ledger
            .schedule_retry(item.id, worker, retry_count, next_attempt_at, error, now)
            .await;
        match lease_checked(item.id, outcome)? {
            Some(_) => {
                tracing::warn!(retry_count, delay_ms = delay.as_millis() as u64, error, "transient delivery failure, retrying");
                Ok(DeliveryResult::Retrying {
                    work_id: item.id,
                    retry_count,
                    next_attempt_at,
                })
            }
            None => Ok(DeliveryResult::LeaseLost { work_id: item.id }),
        }
    }

    async fn fail(
        &self,
        worker: &WorkerId,
        item: &WorkItem,
        kind: FailureKind,
        reason: &str,
    ) -> Result<DeliveryResult> {
        self.fail_with_count(worker, item, kind, reason, item.retry_count)
            .await
    }

    async fn fail_with_count(
        &self,
        worker: &WorkerId,
        item: &WorkItem,
        kind: FailureKind,
        reason: &str,
        retry_count: u32,
    ) -> Result<DeliveryResult> {
        let outcome = self
            .ledger
            .fail_work(item.id, worker, retry_count, reason, self.clock.now())
            .await;
        let Some(failed) = lease_checked(item.id, outcome)? else {
            return Ok(DeliveryResult::LeaseLost { work_id: item.id });
        };

        tracing::error!(kind = kind.as_str(), retry_count, reason, "work item failed");
        // Only the lease holder gets here, so this fires once per failure.
        self.notifier
            .notify(FailureNotice {
                work_id: failed.id,
                business_key: failed.business_key,
                kind,
                retry_count,
                reason: reason.to_string(),
            })
            .await;
        Ok(DeliveryResult::Failed {
            work_id: item.id,
            kind,
        })
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(&self, worker: WorkerId, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = %worker, "relay worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.poll_once(&worker).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    tracing::error!(worker = %worker, error = %e, "relay poll failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        tracing::info!(worker = %worker, "relay worker stopped");
    }
}

/// Turn a lost lease into `None`, leaving other errors alone.
fn lease_checked(id: WorkId, outcome: Result<WorkItem>) -> Result<Option<WorkItem>> {
    match outcome {
        Ok(item) => Ok(Some(item)),
        Err(Error::LeaseLost(_)) => {
            tracing::warn!(work_id = %id, "lease lost before outcome was recorded");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
