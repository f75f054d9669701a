//! Work items and their lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lease::Lease;
use crate::model::outbox::OutboxId;

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of relay work tracked by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier.
    pub id: WorkId,

    /// Business identity of the record this event mutates. Also the
    /// aggregate id in the ledger and the upsert key in the replica.
    pub business_key: String,

    /// Identity of the inbound event (e.g. the webhook delivery id).
    /// Events with the same source id are ingested once.
    pub source_event_id: Option<String>,

    /// Current lifecycle state.
    pub status: Status,

    /// Number of failed delivery attempts (and operator resets).
    pub retry_count: u32,

    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Earliest time the item may be leased again after a transient failure.
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// How many times reconciliation has re-queued this item as stalled.
    pub stall_count: u32,

    /// The outbox record describing this item's downstream effect.
    pub payload_ref: Option<OutboxId>,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// The lease currently recorded on the item, live or not.
    pub fn lease(&self) -> Option<Lease> {
        match (&self.lease_owner, self.lease_expires_at) {
            (Some(owner), Some(expires_at)) => Some(Lease {
                owner: owner.as_str().into(),
                expires_at,
            }),
            _ => None,
        }
    }

    /// Does some worker hold an unexpired lease at `now`?
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease().is_some_and(|l| l.is_live(now))
    }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Ingested, ledger mutation not committed yet.
    Received,
    /// Mutation and outbox record committed; waiting for a worker.
    Queued,
    /// Leased by a worker, delivery in progress.
    Processing,
    /// Replica write applied (or already applied). Terminal.
    Completed,
    /// Permanent failure or exhausted retries. Terminal until reset.
    Failed,
    /// Mutation had no downstream effect. Terminal.
    NotApplicable,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Received, Queued)
                | (Received, NotApplicable)
                | (Queued, Processing)
                | (Queued, Queued)          // operator reset
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Queued)      // retry, stall requeue, reset
                | (Failed, Queued)          // operator reset after exhaustion
                | (Completed, Queued) // operator forced redelivery
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed | Status::NotApplicable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Received => "received",
            Status::Queued => "queued",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::NotApplicable => "not_applicable",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Status::Received),
            "queued" => Ok(Status::Queued),
            "processing" => Ok(Status::Processing),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            "not_applicable" => Ok(Status::NotApplicable),
            _ => Err(crate::error::Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// Builder for new work items. This is what the inbound event handler hands
/// to the engine; the payload itself travels with the ledger mutation.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub(crate) business_key: String,
    pub(crate) source_event_id: Option<String>,
}

impl NewWorkItem {
    pub fn new(business_key: impl Into<String>) -> Self {
        Self {
            business_key: business_key.into(),
            source_event_id: None,
        }
    }

    pub fn source_event_id(mut self, id: impl Into<String>) -> Self {
        self.source_event_id = Some(id.into());
        self
    }

    pub fn business_key(&self) -> &str {
        &self.business_key
    }

    pub(crate) fn into_item(self, now: DateTime<Utc>) -> WorkItem {
        WorkItem {
            id: WorkId::new(),
            business_key: self.business_key,
            source_event_id: self.source_event_id,
            status: Status::Received,
            retry_count: 0,
            lease_owner: None,
            lease_expires_at: None,
            next_attempt_at: None,
            stall_count: 0,
            payload_ref: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Result of ingesting an inbound event.
#[derive(Debug)]
pub enum IngestResult {
    /// New work item created in `received`.
    Created(Box<WorkItem>),
    /// The source event was already ingested.
    Duplicate { existing: WorkId },
}

impl IngestResult {
    pub fn work_id(&self) -> WorkId {
        match self {
            IngestResult::Created(item) => item.id,
            IngestResult::Duplicate { existing } => *existing,
        }
    }
}
