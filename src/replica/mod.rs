//! Replica (document store) port.
//!
//! The replica collection is shared with another service. Each document is
//! keyed by business key; this crate owns an explicit, versioned set of
//! top-level fields in it and records its write metadata under
//! `_owners.<owner>`. Writes touch only those paths and never remove or
//! overwrite anything owned by someone else.

pub mod memory;
pub mod postgres;

pub use memory::MemoryReplica;
pub use postgres::PgReplica;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::idempotency::IdempotencyKey;
use crate::model::outbox::DeliveryPayload;

/// Sub-document holding each owner's write metadata.
pub const OWNERS_FIELD: &str = "_owners";

/// Which document fields this service owns, under which schema version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOwnership {
    /// Owner name, used as the key under `_owners`.
    pub owner: String,
    /// Bumped whenever the owned field set changes.
    pub schema_version: u32,
    pub fields: BTreeSet<String>,
}

impl FieldOwnership {
    pub fn new<I, S>(owner: impl Into<String>, schema_version: u32, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            owner: owner.into(),
            schema_version,
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn owns(&self, field: &str) -> bool {
        self.fields.contains(field)
    }
}

/// Write metadata stored under `_owners.<owner>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerStamp {
    pub schema_version: u32,
    /// Ledger aggregate version the owned fields were written from.
    pub source_version: u64,
    pub idempotency_key: String,
    pub written_at: DateTime<Utc>,
}

/// One owned-fields upsert.
#[derive(Debug, Clone)]
pub struct OwnedWrite {
    pub ownership: FieldOwnership,
    pub payload: DeliveryPayload,
    pub idempotency_key: IdempotencyKey,
    pub written_at: DateTime<Utc>,
}

impl OwnedWrite {
    /// Reject writes that would touch fields we do not own.
    pub fn validate(&self) -> Result<(), ReplicaError> {
        self.payload.validate().map_err(ReplicaError::InvalidPayload)?;
        if let Some(field) = self
            .payload
            .fields
            .keys()
            .find(|f| !self.ownership.owns(f) || f.as_str() == OWNERS_FIELD)
        {
            return Err(ReplicaError::InvalidPayload(format!(
                "field `{field}` is not owned by {}",
                self.ownership.owner
            )));
        }
        Ok(())
    }

    pub fn stamp(&self) -> OwnerStamp {
        OwnerStamp {
            schema_version: self.ownership.schema_version,
            source_version: self.payload.version,
            idempotency_key: self.idempotency_key.to_string(),
            written_at: self.written_at,
        }
    }
}

/// Acknowledgement of an owned-fields upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    /// False when the replica already held a newer source version and the
    /// write was skipped.
    pub written: bool,
    /// Source version now stored for our owned fields.
    pub stored_version: u64,
}

/// Our owned view of one replica document.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedSnapshot {
    /// Owned fields currently present in the document.
    pub fields: Map<String, Value>,
    /// Our last write stamp, if we ever wrote this document.
    pub stamp: Option<OwnerStamp>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicaError {
    /// Store unreachable or refusing connections.
    #[error("replica unavailable: {0}")]
    Unavailable(String),

    /// Attempt exceeded its time budget.
    #[error("replica write timed out")]
    Timeout,

    /// The payload can never be written as-is.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl ReplicaError {
    /// Transient errors are retried with backoff; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReplicaError::Unavailable(_) | ReplicaError::Timeout)
    }
}

#[async_trait]
pub trait Replica: Send + Sync {
    /// Upsert the owned fields of one document by business key.
    ///
    /// Implementations must set only the fields in `write.payload.fields`,
    /// unset owned fields absent from it, write the owner stamp, leave every
    /// other path untouched, and skip the write when the stored source
    /// version is newer than `write.payload.version`.
    async fn upsert_owned(&self, write: &OwnedWrite) -> Result<WriteAck, ReplicaError>;

    /// Read our owned fields of one document. `None` if the document does
    /// not exist.
    async fn read_owned(
        &self,
        collection: &str,
        business_key: &str,
        ownership: &FieldOwnership,
    ) -> Result<Option<OwnedSnapshot>, ReplicaError>;
}

/// Apply an owned write to a document body, the way every backend must.
pub(crate) fn merge_owned(document: &mut Map<String, Value>, write: &OwnedWrite) -> WriteAck {
    let stored_version = stored_stamp(document, &write.ownership.owner)
        .map(|s| s.source_version)
        .unwrap_or(0);

    if stored_version > write.payload.version {
        return WriteAck {
            written: false,
            stored_version,
        };
    }

    for field in &write.ownership.fields {
        match write.payload.fields.get(field) {
            Some(value) => {
                document.insert(field.clone(), value.clone());
            }
            None => {
                document.remove(field);
            }
        }
    }

    let owners = document
        .entry(OWNERS_FIELD.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !owners.is_object() {
        *owners = Value::Object(Map::new());
    }
    if let Value::Object(owners) = owners {
        owners.insert(
            write.ownership.owner.clone(),
            serde_json::to_value(write.stamp()).unwrap_or(Value::Null),
        );
    }

    WriteAck {
        written: true,
        stored_version: write.payload.version,
    }
}

/// Extract our owned view of a document body.
pub(crate) fn owned_view(document: &Map<String, Value>, ownership: &FieldOwnership) -> OwnedSnapshot {
    OwnedSnapshot {
        fields: crate::model::outbox::project_fields(document, &ownership.fields),
        stamp: stored_stamp(document, &ownership.owner),
    }
}

fn stored_stamp(document: &Map<String, Value>, owner: &str) -> Option<OwnerStamp> {
    document
        .get(OWNERS_FIELD)
        .and_then(|owners| owners.get(owner))
        .and_then(|stamp| serde_json::from_value(stamp.clone()).ok())
}
