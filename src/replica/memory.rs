//! In-memory replica with fault injection, for tests and local runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::{
    FieldOwnership, OwnedSnapshot, OwnedWrite, Replica, ReplicaError, WriteAck, merge_owned,
    owned_view,
};

type DocKey = (String, String);

#[derive(Default)]
struct Faults {
    /// Remaining transient failures per business key.
    transient: HashMap<String, u32>,
    /// Business keys whose writes are always rejected.
    rejected: HashSet<String>,
    /// Fail every call while set.
    down: bool,
}

/// Replica held in a `HashMap` of `(collection, business_key)` documents.
#[derive(Default)]
pub struct MemoryReplica {
    documents: Mutex<HashMap<DocKey, Map<String, Value>>>,
    faults: Mutex<Faults>,
    writes: AtomicU64,
}

impl MemoryReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes for `business_key` as if the store were
    /// unreachable.
    pub async fn fail_transiently(&self, business_key: &str, n: u32) {
        self.faults
            .lock()
            .await
            .transient
            .insert(business_key.to_string(), n);
    }

    /// Reject every write for `business_key` as structurally invalid.
    pub async fn reject(&self, business_key: &str) {
        self.faults
            .lock()
            .await
            .rejected
            .insert(business_key.to_string());
    }

    /// Take the whole store down (or bring it back).
    pub async fn set_down(&self, down: bool) {
        self.faults.lock().await.down = down;
    }

    /// Number of writes that actually changed a document.
    pub fn applied_writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Full document body, including fields owned by other services.
    pub async fn document(&self, collection: &str, business_key: &str) -> Option<Map<String, Value>> {
        self.documents
            .lock()
            .await
            .get(&(collection.to_string(), business_key.to_string()))
            .cloned()
    }

    /// Write a field the way an independent service would, bypassing
    /// ownership checks.
    pub async fn edit_field(&self, collection: &str, business_key: &str, field: &str, value: Value) {
        self.documents
            .lock()
            .await
            .entry((collection.to_string(), business_key.to_string()))
            .or_default()
            .insert(field.to_string(), value);
    }

    /// Drop a document entirely (e.g. lost in a restore).
    pub async fn remove_document(&self, collection: &str, business_key: &str) {
        self.documents
            .lock()
            .await
            .remove(&(collection.to_string(), business_key.to_string()));
    }
}

#[async_trait]
impl Replica for MemoryReplica {
    async fn upsert_owned(&self, write: &OwnedWrite) -> Result<WriteAck, ReplicaError> {
        let key = &write.payload.business_key;
        {
            let mut faults = self.faults.lock().await;
            if faults.down {
                return Err(ReplicaError::Unavailable("replica is down".to_string()));
            }
            if faults.rejected.contains(key) {
                return Err(ReplicaError::InvalidPayload(format!(
                    "document {key} rejected by replica schema"
                )));
            }
            if let Some(remaining) = faults.transient.get_mut(key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ReplicaError::Unavailable(format!(
                        "connection reset while writing {key}"
                    )));
                }
            }
        }

        write.validate()?;

        let mut documents = self.documents.lock().await;
        let document = documents
            .entry((write.payload.collection.clone(), key.clone()))
            .or_default();
        let ack = merge_owned(document, write);
        if ack.written {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(ack)
    }

    async fn read_owned(
        &self,
        collection: &str,
        business_key: &str,
        ownership: &FieldOwnership,
    ) -> Result<Option<OwnedSnapshot>, ReplicaError> {
        if self.faults.lock().await.down {
            return Err(ReplicaError::Unavailable("replica is down".to_string()));
        }
        Ok(self
            .documents
            .lock()
            .await
            .get(&(collection.to_string(), business_key.to_string()))
            .map(|doc| owned_view(doc, ownership)))
    }
}
