//! Reconciliation engine.
//!
//! A sweep audits every business key whose work reached a terminal state
//! inside the lookback window, comparing the ledger's owned projection with
//! the replica's owned fields and the last known-synced baseline:
//!
//! | replica owned fields          | class           | action               |
//! |-------------------------------|-----------------|----------------------|
//! | equal to ledger               | `no_action`     |                      |
//! | missing                       | `re_syncable`   | rewrite from ledger  |
//! | equal to baseline, not ledger | `re_syncable`   | rewrite from ledger  |
//! | anything else                 | `manual_review` | flag, never written  |
//!
//! Items stuck in `processing` with no live lease are `stalled` and get
//! re-queued, or flagged once they have stalled too often. Repair writes go
//! through the idempotency guard, so a sweep running alongside live relay
//! workers cannot double-apply anything.
//!
//! Keys whose latest item `failed` are never rewritten: only an operator
//! reset puts them back into automatic processing, so they are flagged.
//! Keys that cannot be read on either side are skipped, not classified.

pub mod scheduler;

pub use scheduler::ReconcileScheduler;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::Instrument as _;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::idempotency::{IdempotencyGuard, content_hash};
use crate::lease::WorkerId;
use crate::ledger::{Ledger, SyncBaseline};
use crate::model::idempotency::RecordedOutcome;
use crate::model::outbox::{DeliveryPayload, OperationKind, project_fields};
use crate::model::report::{
    ClassCounts, DivergenceClass, Finding, ReconciliationReport, RepairAction, health_score,
};
use crate::model::work::{Status, WorkItem};
use crate::replica::{FieldOwnership, OwnedSnapshot, OwnedWrite, Replica, ReplicaError};
use crate::telemetry::{metrics, work as spans};

/// Reconciliation tunables.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Time between scheduled sweeps.
    pub interval: Duration,
    /// How far back a sweep looks for terminal work items.
    pub lookback: Duration,
    /// How long an item may sit in `processing` before it counts as stalled.
    pub stall_threshold: Duration,
    /// Stalled items re-queued this many times are flagged instead.
    pub max_stall_requeues: u32,
    /// Health scores below this are logged as degraded consistency.
    pub health_threshold: f64,
    /// Upper bound on each replica read or repair write.
    pub replica_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            lookback: Duration::from_secs(24 * 3600),
            stall_threshold: Duration::from_secs(600),
            max_stall_requeues: 3,
            health_threshold: 0.95,
            replica_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.health_threshold) {
            return Err(Error::Config(format!(
                "health threshold {} is outside [0, 1]",
                self.health_threshold
            )));
        }
        if self.interval.is_zero() {
            return Err(Error::Config(
                "reconciliation interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of checking one business key.
struct Check {
    class: DivergenceClass,
    detail: String,
    action: Option<RepairAction>,
}

impl Check {
    fn clean() -> Self {
        Self {
            class: DivergenceClass::NoAction,
            detail: String::new(),
            action: None,
        }
    }
}

/// Why a key was left out of a sweep.
#[derive(Debug, thiserror::Error)]
enum Unchecked {
    #[error("replica unreachable: {0}")]
    Replica(#[from] ReplicaError),
    #[error("ledger unavailable: {0}")]
    Ledger(#[from] Error),
}

/// The ledger side of one key.
enum LedgerSide {
    /// Nothing was delivered for this key.
    Nothing,
    /// The delivered payload cannot be interpreted.
    Undecodable(String),
    Expected(Expected),
}

/// What the ledger says the replica should hold for one key.
struct Expected {
    collection: String,
    version: u64,
    fields: serde_json::Map<String, Value>,
    hash: String,
}

pub struct ReconciliationEngine {
    ledger: Arc<dyn Ledger>,
    replica: Arc<dyn Replica>,
    ownership: FieldOwnership,
    clock: Arc<dyn Clock>,
    guard: IdempotencyGuard,
    identity: WorkerId,
    config: ReconcileConfig,
    /// One sweep at a time per engine.
    sweep_lock: Mutex<()>,
}

impl ReconciliationEngine {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        replica: Arc<dyn Replica>,
        ownership: FieldOwnership,
        config: ReconcileConfig,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            guard: Self::guard_for(&ledger, &clock, &config),
            ledger,
            replica,
            ownership,
            clock,
            identity: WorkerId::unique("reconciler"),
            config,
            sweep_lock: Mutex::new(()),
        }
    }

    fn guard_for(
        ledger: &Arc<dyn Ledger>,
        clock: &Arc<dyn Clock>,
        config: &ReconcileConfig,
    ) -> IdempotencyGuard {
        // Hold keys a little longer than a repair write may take.
        IdempotencyGuard::new(
            Arc::clone(ledger),
            Arc::clone(clock),
            config.replica_timeout * 2,
        )
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.guard = Self::guard_for(&self.ledger, &clock, &self.config);
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Run one sweep and append its report to the ledger.
    pub async fn sweep(&self) -> Result<ReconciliationReport> {
        let _serial = self.sweep_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = spans::start_sweep_span(&run_id);
        let report = self.sweep_inner(run_id).instrument(span.clone()).await?;
        span.record("reconcile.health", report.health_score);
        Ok(report)
    }

    async fn sweep_inner(&self, run_id: Uuid) -> Result<ReconciliationReport> {
        let start = Instant::now();
        let window_end = self.clock.now();
        let window_start = chrono::Duration::from_std(self.config.lookback)
            .ok()
            .and_then(|d| window_end.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut counts = ClassCounts::default();
        let mut findings = Vec::new();
        let mut skipped = 0;

        // Latest terminal item per business key; items come oldest first.
        let mut latest: BTreeMap<String, WorkItem> = BTreeMap::new();
        for item in self.ledger.terminal_in_window(window_start, window_end).await? {
            latest.insert(item.business_key.clone(), item);
        }

        for item in latest.into_values() {
            match self.check_key(run_id, &item).await {
                Ok(check) => record(&mut counts, &mut findings, &item, check),
                Err(e) => {
                    tracing::warn!(
                        business_key = %item.business_key,
                        error = %e,
                        "key not checked"
                    );
                    skipped += 1;
                }
            }
        }

        // Repairs above are already written; from here on failures end up
        // in the report rather than aborting it.
        let stall_cutoff = chrono::Duration::from_std(self.config.stall_threshold)
            .ok()
            .and_then(|d| window_end.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let stalled = match self.ledger.stalled_candidates(stall_cutoff, window_end).await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(error = %e, "stalled work not listed this sweep");
                Vec::new()
            }
        };
        for item in stalled {
            let check = self.handle_stalled(&item).await;
            record(&mut counts, &mut findings, &item, check);
        }

        let report = ReconciliationReport {
            run_id,
            window_start,
            window_end,
            counts,
            skipped,
            health_score: health_score(counts.checked(), counts.divergent()),
            findings,
            generated_at: self.clock.now(),
        };
        self.ledger.append_report(&report).await?;

        self.observe_backlog(window_end).await;
        metrics::reconciliation_health().record(report.health_score, &[]);
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "reconcile")],
        );

        if report.health_score < self.config.health_threshold {
            tracing::warn!(
                health = report.health_score,
                threshold = self.config.health_threshold,
                checked = report.checked(),
                divergent = report.divergent(),
                "consistency degraded"
            );
        } else {
            tracing::info!(
                health = report.health_score,
                checked = report.checked(),
                divergent = report.divergent(),
                repairs = report.repairs_taken(),
                skipped,
                "reconciliation sweep finished"
            );
        }
        Ok(report)
    }

    /// Compare one business key and repair it if it is re-syncable.
    async fn check_key(&self, run_id: Uuid, item: &WorkItem) -> std::result::Result<Check, Unchecked> {
        let expected = match self.expected_state(item).await? {
            LedgerSide::Expected(expected) => expected,
            LedgerSide::Nothing => return Ok(Check::clean()),
            LedgerSide::Undecodable(detail) => {
                return Ok(Check {
                    class: DivergenceClass::ManualReview,
                    detail,
                    action: Some(RepairAction::Flagged),
                });
            }
        };

        let snapshot = tokio::time::timeout(
            self.config.replica_timeout,
            self.replica
                .read_owned(&expected.collection, &item.business_key, &self.ownership),
        )
        .await
        .map_err(|_| ReplicaError::Timeout)??;

        let baseline = self.ledger.sync_baseline(&item.business_key).await?;

        let (class, detail) = classify(&expected, snapshot.as_ref(), baseline.as_ref());
        let check = match class {
            DivergenceClass::ReSyncable if item.status == Status::Failed => Check {
                class,
                detail: format!("{detail}; delivery failed, awaiting operator reset"),
                action: Some(RepairAction::Flagged),
            },
            DivergenceClass::ReSyncable => Check {
                class,
                action: Some(self.resync(run_id, &item.business_key, &expected).await),
                detail,
            },
            DivergenceClass::ManualReview => Check {
                class,
                detail,
                action: Some(RepairAction::Flagged),
            },
            _ => Check {
                class,
                detail,
                action: None,
            },
        };
        Ok(check)
    }

    async fn expected_state(&self, item: &WorkItem) -> Result<LedgerSide> {
        let Some(outbox_id) = item.payload_ref else {
            return Ok(LedgerSide::Nothing);
        };
        let record = self.ledger.get_outbox_record(outbox_id).await?;
        let delivered = match DeliveryPayload::from_value(&record.payload) {
            Ok(delivered) => delivered,
            Err(detail) => return Ok(LedgerSide::Undecodable(detail)),
        };
        let Some(aggregate) = self.ledger.get_aggregate(&item.business_key).await? else {
            return Ok(LedgerSide::Nothing);
        };

        let fields = project_fields(&aggregate.state, &self.ownership.fields);
        Ok(LedgerSide::Expected(Expected {
            collection: delivered.collection,
            version: aggregate.version,
            hash: content_hash(&Value::Object(fields.clone())),
            fields,
        }))
    }

    async fn resync(&self, run_id: Uuid, business_key: &str, expected: &Expected) -> RepairAction {
        let payload = DeliveryPayload {
            business_key: business_key.to_string(),
            collection: expected.collection.clone(),
            version: expected.version,
            fields: expected.fields.clone(),
        };
        // Keyed per run: a later sweep may repair the same state again.
        let keyed = json!({ "run_id": run_id, "payload": &payload });
        let replica = Arc::clone(&self.replica);
        let ownership = self.ownership.clone();
        let timeout = self.config.replica_timeout;
        let written_at = self.clock.now();
        let hash = expected.hash.clone();

        let applied = self
            .guard
            .apply(
                &self.identity,
                OperationKind::Resync,
                business_key,
                &keyed,
                move |key| async move {
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
            .await;

        match applied {
            Ok(applied) => match applied.outcome().clone() {
                RecordedOutcome::Applied {
                    version,
                    content_hash,
                    ..
                } => {
                    let baseline = SyncBaseline {
                        business_key: business_key.to_string(),
                        synced_hash: content_hash,
                        synced_version: version,
                        synced_at: self.clock.now(),
                    };
                    if let Err(e) = self.ledger.record_sync_baseline(baseline).await {
                        tracing::warn!(business_key, error = %e, "repair written but baseline not recorded");
                    }
                    tracing::info!(business_key, version, "replica re-synced from ledger");
                    RepairAction::Rewritten { version }
                }
                RecordedOutcome::Rejected { reason } => RepairAction::RepairFailed { error: reason },
            },
            Err(e) => {
                tracing::warn!(business_key, error = %e, "repair write did not go through");
                RepairAction::RepairFailed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn handle_stalled(&self, item: &WorkItem) -> Check {
        let since = item
            .started_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());

        if item.stall_count >= self.config.max_stall_requeues {
            tracing::warn!(
                work_id = %item.id,
                stall_count = item.stall_count,
                "work item repeatedly stalled, flagged"
            );
            return Check {
                class: DivergenceClass::Stalled,
                detail: format!(
                    "processing since {since}, stalled {} times",
                    item.stall_count
                ),
                action: Some(RepairAction::Flagged),
            };
        }

        match self.ledger.requeue_stalled(item.id, self.clock.now()).await {
            Ok(true) => {
                tracing::info!(work_id = %item.id, "stalled work item re-queued");
                metrics::work_state_transitions().add(
                    1,
                    &[
                        KeyValue::new("from", Status::Processing.as_str()),
                        KeyValue::new("to", Status::Queued.as_str()),
                    ],
                );
                Check {
                    class: DivergenceClass::Stalled,
                    detail: format!("processing since {since} without a live lease"),
                    action: Some(RepairAction::Requeued),
                }
            }
            // A worker picked it up between listing and re-queueing.
            Ok(false) => Check::clean(),
            Err(e) => {
                tracing::warn!(work_id = %item.id, error = %e, "stalled work item not re-queued");
                Check {
                    class: DivergenceClass::Stalled,
                    detail: format!("processing since {since} without a live lease"),
                    action: Some(RepairAction::RepairFailed {
                        error: e.to_string(),
                    }),
                }
            }
        }
    }

    async fn observe_backlog(&self, now: DateTime<Utc>) {
        match self.ledger.backlog().await {
            Ok(backlog) => {
                let age = backlog
                    .oldest_created_at
                    .map(|t| (now - t).num_milliseconds().max(0) as f64 / 1000.0)
                    .unwrap_or(0.0);
                metrics::backlog_depth().record(backlog.undelivered, &[]);
                metrics::backlog_age_secs().record(age, &[]);
                tracing::info!(
                    undelivered = backlog.undelivered,
                    oldest_age_secs = age,
                    "outbox backlog"
                );
            }
            Err(e) => tracing::warn!(error = %e, "failed to read outbox backlog"),
        }
    }
}

fn record(counts: &mut ClassCounts, findings: &mut Vec<Finding>, item: &WorkItem, check: Check) {
    counts.add(check.class);
    metrics::reconciliation_findings().add(1, &[KeyValue::new("class", check.class.as_str())]);
    if let Some(action) = check.action {
        findings.push(Finding {
            work_id: item.id,
            business_key: item.business_key.clone(),
            class: check.class,
            detail: check.detail,
            action,
        });
    }
}

fn classify(
    expected: &Expected,
    snapshot: Option<&OwnedSnapshot>,
    baseline: Option<&SyncBaseline>,
) -> (DivergenceClass, String) {
    let Some(snapshot) = snapshot else {
        return (
            DivergenceClass::ReSyncable,
            "replica document missing".to_string(),
        );
    };
    if snapshot.fields.is_empty() && snapshot.stamp.is_none() {
        return (
            DivergenceClass::ReSyncable,
            "owned fields missing from replica document".to_string(),
        );
    }

    let replica_hash = content_hash(&Value::Object(snapshot.fields.clone()));
    if replica_hash == expected.hash {
        return (DivergenceClass::NoAction, String::new());
    }

    match baseline {
        Some(baseline) if baseline.synced_hash == replica_hash => (
            DivergenceClass::ReSyncable,
            format!(
                "replica at synced version {}, ledger at version {}",
                baseline.synced_version, expected.version
            ),
        ),
        _ => (
            DivergenceClass::ManualReview,
            format!(
                "replica edited since last sync: ledger {}, replica {}",
                Value::Object(expected.fields.clone()),
                Value::Object(snapshot.fields.clone())
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected(fields: Value) -> Expected {
        let fields = fields.as_object().cloned().unwrap_or_default();
        Expected {
            collection: "replies".into(),
            version: 2,
            hash: content_hash(&Value::Object(fields.clone())),
            fields,
        }
    }

    fn snapshot(fields: Value) -> OwnedSnapshot {
        OwnedSnapshot {
            fields: fields.as_object().cloned().unwrap_or_default(),
            stamp: None,
        }
    }

    fn baseline(fields: Value) -> SyncBaseline {
        SyncBaseline {
            business_key: "reply-1".into(),
            synced_hash: content_hash(&fields),
            synced_version: 1,
            synced_at: Utc::now(),
        }
    }

    #[test]
    fn matching_states_need_no_action() {
        let (class, _) = classify(
            &expected(json!({"amount": 500})),
            Some(&snapshot(json!({"amount": 500}))),
            None,
        );
        assert_eq!(class, DivergenceClass::NoAction);
    }

    #[test]
    fn missing_document_is_resyncable() {
        let (class, _) = classify(&expected(json!({"amount": 500})), None, None);
        assert_eq!(class, DivergenceClass::ReSyncable);
    }

    #[test]
    fn replica_at_baseline_is_stale() {
        let (class, _) = classify(
            &expected(json!({"amount": 500})),
            Some(&snapshot(json!({"amount": 400}))),
            Some(&baseline(json!({"amount": 400}))),
        );
        assert_eq!(class, DivergenceClass::ReSyncable);
    }

    #[test]
    fn replica_edit_since_baseline_is_a_conflict() {
        let (class, detail) = classify(
            &expected(json!({"amount": 500})),
            Some(&snapshot(json!({"amount": 450}))),
            Some(&baseline(json!({"amount": 500}))),
        );
        assert_eq!(class, DivergenceClass::ManualReview);
        assert!(detail.contains("450"));
    }
}
