//! Idempotency guard for replica writes.
//!
//! Every externally visible effect is fingerprinted as
//! `operation:aggregate_id:sha256(payload)`. Before executing, the guard
//! takes a time-bounded hold on the key in the ledger (the same
//! compare-and-set used for work leases). A key with a recorded outcome is
//! never executed again; its outcome is returned from the ledger instead.
//!
//! The replica write itself carries the key in its owner stamp and is
//! version-guarded, so if the process dies between the write and the
//! settle, re-executing it under the same key leaves the replica unchanged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::clock::Clock;
use crate::error::Error;
use crate::lease::{LeaseClaim, WorkerId};
use crate::ledger::Ledger;
use crate::model::idempotency::{IdempotencyKey, KeyClaim, RecordedOutcome};
use crate::model::outbox::OperationKind;
use crate::replica::ReplicaError;

/// Hex SHA-256 of the canonical JSON encoding of `value`.
///
/// `serde_json::Map` is ordered by key, so equal values always encode to
/// the same bytes.
pub fn content_hash(value: &Value) -> String {
    let canonical = value.to_string();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

/// Deterministic key for one operation on one aggregate with one payload.
pub fn derive_key(operation: OperationKind, aggregate_id: &str, payload: &Value) -> IdempotencyKey {
    IdempotencyKey(format!(
        "{}:{}:{}",
        operation.as_str(),
        aggregate_id,
        content_hash(payload)
    ))
}

/// Result of [`IdempotencyGuard::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// The effect ran during this call.
    Executed(RecordedOutcome),
    /// The effect had already run; nothing was executed.
    Cached(RecordedOutcome),
}

impl Applied {
    pub fn outcome(&self) -> &RecordedOutcome {
        match self {
            Applied::Executed(outcome) | Applied::Cached(outcome) => outcome,
        }
    }

    pub fn was_cached(&self) -> bool {
        matches!(self, Applied::Cached(_))
    }
}

#[derive(Debug, Error)]
pub enum GuardError {
    /// The effect failed in a way worth retrying. The key was released.
    #[error(transparent)]
    Transient(ReplicaError),

    /// Another holder is executing the same effect right now.
    #[error("idempotency key {key} is held by {holder}")]
    Busy { key: IdempotencyKey, holder: String },

    #[error(transparent)]
    Ledger(#[from] Error),
}

impl GuardError {
    /// Should the caller retry later?
    pub fn is_transient(&self) -> bool {
        matches!(self, GuardError::Transient(_) | GuardError::Busy { .. })
    }
}

/// Runs keyed side effects at most once.
#[derive(Clone)]
pub struct IdempotencyGuard {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    hold_ttl: Duration,
}

impl IdempotencyGuard {
    /// `hold_ttl` bounds how long a crashed holder blocks the key; it should
    /// exceed the per-attempt timeout.
    pub fn new(ledger: Arc<dyn Ledger>, clock: Arc<dyn Clock>, hold_ttl: Duration) -> Self {
        Self {
            ledger,
            clock,
            hold_ttl,
        }
    }

    /// Execute `effect` unless the key for `(operation, aggregate_id,
    /// payload)` already has an outcome.
    ///
    /// A permanent effect error is recorded as [`RecordedOutcome::Rejected`]
    /// so it is never attempted again. A transient one releases the key and
    /// is returned as [`GuardError::Transient`].
    pub async fn apply<F, Fut>(
        &self,
        holder: &WorkerId,
        operation: OperationKind,
        aggregate_id: &str,
        payload: &Value,
        effect: F,
    ) -> Result<Applied, GuardError>
    where
        F: FnOnce(IdempotencyKey) -> Fut,
        Fut: Future<Output = Result<RecordedOutcome, ReplicaError>>,
    {
        let key = derive_key(operation, aggregate_id, payload);
        let claim = LeaseClaim::new(holder.clone(), self.clock.now(), self.hold_ttl);

        match self.ledger.claim_idempotency_key(&key, &claim).await? {
            KeyClaim::Settled(outcome) => {
                tracing::debug!(key = %key, "idempotency key already settled");
                return Ok(Applied::Cached(outcome));
            }
            KeyClaim::Busy { holder } => return Err(GuardError::Busy { key, holder }),
            KeyClaim::Acquired => {}
        }

        let outcome = match effect(key.clone()).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_transient() => {
                if let Err(release) = self.ledger.release_idempotency_key(&key, holder).await {
                    // The hold expires on its own.
                    tracing::warn!(key = %key, error = %release, "failed to release idempotency key");
                }
                return Err(GuardError::Transient(e));
            }
            Err(e) => RecordedOutcome::Rejected {
                reason: e.to_string(),
            },
        };

        let stored = self
            .ledger
            .settle_idempotency_key(&key, holder, outcome.clone(), self.clock.now())
            .await?;
        if stored != outcome {
            // Someone settled first after our hold expired.
            return Ok(Applied::Cached(stored));
        }
        Ok(Applied::Executed(stored))
    }
}
