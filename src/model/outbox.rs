//! Outbox records, ledger mutations and the delivery payload they carry.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::model::work::WorkId;

/// Newtype for outbox record IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutboxId(pub Uuid);

impl OutboxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OutboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OutboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of downstream write an outbox record (or a repair) performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Normal delivery of a committed mutation.
    Upsert,
    /// Reconciliation rewriting the replica from the ledger.
    Resync,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Upsert => "upsert",
            OperationKind::Resync => "resync",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upsert" => Ok(OperationKind::Upsert),
            "resync" => Ok(OperationKind::Resync),
            _ => Err(crate::error::Error::Other(format!("unknown operation: {s}"))),
        }
    }
}

/// A durable record of a pending downstream effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: OutboxId,
    pub work_id: WorkId,
    /// Business key of the ledger aggregate the mutation touched.
    pub aggregate_id: String,
    pub operation: OperationKind,
    /// Serialized [`DeliveryPayload`]. Kept as raw JSON so a record that no
    /// longer decodes is still readable for audit.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub delivery_attempts: u32,
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// Field-level change to a ledger aggregate. Fields are merged into the
/// aggregate's state; a `null` value clears the field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerMutation {
    pub fields: Map<String, Value>,
}

impl LedgerMutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Merge this mutation into an aggregate state object.
    pub fn apply_to(&self, state: &mut Map<String, Value>) {
        for (field, value) in &self.fields {
            if value.is_null() {
                state.remove(field);
            } else {
                state.insert(field.clone(), value.clone());
            }
        }
    }
}

/// Description of the downstream effect a mutation requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamEffect {
    pub operation: OperationKind,
    /// Replica collection the aggregate is mirrored into.
    pub collection: String,
    /// Aggregate fields the replica copy is made of.
    pub fields: BTreeSet<String>,
}

/// Everything the ledger needs to commit one mutation atomically.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub work_id: WorkId,
    pub mutation: LedgerMutation,
    pub effect: Option<DownstreamEffect>,
}

/// What a commit produced.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub aggregate: Aggregate,
    /// `None` when the mutation had no downstream effect.
    pub outbox: Option<OutboxRecord>,
}

/// Authoritative ledger state for one business key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregate {
    pub business_key: String,
    pub state: Map<String, Value>,
    /// Bumped on every committed mutation.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Delivery payload
// ---------------------------------------------------------------------------

/// The replica write an outbox record asks for: the owned projection of an
/// aggregate at a given version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub business_key: String,
    pub collection: String,
    pub version: u64,
    pub fields: Map<String, Value>,
}

impl DeliveryPayload {
    /// Build the payload for `aggregate` restricted to `fields`.
    pub fn project(aggregate: &Aggregate, collection: &str, fields: &BTreeSet<String>) -> Self {
        Self {
            business_key: aggregate.business_key.clone(),
            collection: collection.to_string(),
            version: aggregate.version,
            fields: project_fields(&aggregate.state, fields),
        }
    }

    /// Decode a stored outbox payload.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let payload: DeliveryPayload =
            serde_json::from_value(value.clone()).map_err(|e| format!("undecodable payload: {e}"))?;
        payload.validate()?;
        Ok(payload)
    }

    /// Structural checks a payload must pass to be deliverable at all.
    pub fn validate(&self) -> Result<(), String> {
        if self.business_key.trim().is_empty() {
            return Err("payload has an empty business key".to_string());
        }
        if self.collection.trim().is_empty() {
            return Err("payload has an empty collection".to_string());
        }
        if self.version == 0 {
            return Err("payload references aggregate version 0".to_string());
        }
        Ok(())
    }
}

/// Restrict a state object to the given field names.
pub fn project_fields(state: &Map<String, Value>, fields: &BTreeSet<String>) -> Map<String, Value> {
    state
        .iter()
        .filter(|(k, _)| fields.contains(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
