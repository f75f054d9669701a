//! Idempotency keys and the outcomes recorded against them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deterministic fingerprint of a downstream operation:
/// `operation:aggregate_id:sha256(payload)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The observable result of executing a keyed side effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordedOutcome {
    /// The replica accepted the write (or already held a newer version).
    Applied {
        /// Aggregate version that was written.
        version: u64,
        /// Content hash of the owned fields that were written.
        content_hash: String,
        /// False when the replica kept a newer version it already had.
        written: bool,
    },
    /// The payload can never be delivered.
    Rejected { reason: String },
}

/// Ledger row backing an idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub first_seen_at: DateTime<Utc>,
    /// `None` while the effect is being executed.
    pub outcome: Option<RecordedOutcome>,
    /// Who is executing the effect right now, and until when.
    pub holder: Option<String>,
    pub hold_expires_at: Option<DateTime<Utc>>,
}

/// Result of trying to take ownership of a key before executing its effect.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyClaim {
    /// Caller may execute the effect, then settle or release the key.
    Acquired,
    /// The effect already ran; this is its outcome.
    Settled(RecordedOutcome),
    /// Another holder is executing the effect under a live hold.
    Busy { holder: String },
}
