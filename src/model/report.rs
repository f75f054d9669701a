//! Reconciliation reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::work::WorkId;

/// How a checked item compares between ledger and replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceClass {
    /// Replica missing or stale, no independent replica edit.
    ReSyncable,
    /// Replica edited independently and disagrees with the ledger.
    ManualReview,
    /// Stuck in `processing` with nobody holding a live lease.
    Stalled,
    /// Ledger and replica agree.
    NoAction,
}

impl DivergenceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            DivergenceClass::ReSyncable => "re_syncable",
            DivergenceClass::ManualReview => "manual_review",
            DivergenceClass::Stalled => "stalled",
            DivergenceClass::NoAction => "no_action",
        }
    }

    pub fn is_divergent(self) -> bool {
        !matches!(self, DivergenceClass::NoAction)
    }
}

impl std::fmt::Display for DivergenceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the sweep did about a finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepairAction {
    /// Replica rewritten from the ledger through the idempotency guard.
    Rewritten { version: u64 },
    /// Stalled item's lease cleared and item re-queued.
    Requeued,
    /// Left for an operator.
    Flagged,
    /// Repair attempted but did not go through; the next sweep retries.
    RepairFailed { error: String },
}

/// One divergent item, individually auditable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub work_id: WorkId,
    pub business_key: String,
    pub class: DivergenceClass,
    pub detail: String,
    pub action: RepairAction,
}

/// Per-class counts for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    pub re_syncable: u32,
    pub manual_review: u32,
    pub stalled: u32,
    pub no_action: u32,
}

impl ClassCounts {
    pub fn add(&mut self, class: DivergenceClass) {
        match class {
            DivergenceClass::ReSyncable => self.re_syncable += 1,
            DivergenceClass::ManualReview => self.manual_review += 1,
            DivergenceClass::Stalled => self.stalled += 1,
            DivergenceClass::NoAction => self.no_action += 1,
        }
    }

    pub fn checked(&self) -> u32 {
        self.divergent() + self.no_action
    }

    pub fn divergent(&self) -> u32 {
        self.re_syncable + self.manual_review + self.stalled
    }
}

/// `(checked - divergent) / checked`, 1.0 for an empty sweep.
pub fn health_score(checked: u32, divergent: u32) -> f64 {
    if checked == 0 {
        return 1.0;
    }
    f64::from(checked.saturating_sub(divergent)) / f64::from(checked)
}

/// Immutable record of one reconciliation sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub run_id: Uuid,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub counts: ClassCounts,
    /// Items that could not be compared because the replica was unreachable.
    /// Not part of `checked`.
    #[serde(default)]
    pub skipped: u32,
    pub findings: Vec<Finding>,
    pub health_score: f64,
    pub generated_at: DateTime<Utc>,
}

impl ReconciliationReport {
    pub fn checked(&self) -> u32 {
        self.counts.checked()
    }

    pub fn divergent(&self) -> u32 {
        self.counts.divergent()
    }

    /// Number of repairs that actually rewrote or re-queued something.
    pub fn repairs_taken(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| {
                matches!(
                    f.action,
                    RepairAction::Rewritten { .. } | RepairAction::Requeued
                )
            })
            .count()
    }

    pub fn findings_of(&self, class: DivergenceClass) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.class == class)
    }
}
