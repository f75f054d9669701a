//! Time-bounded exclusive claims.
//!
//! A lease is the pair `(owner, expires_at)`. Acquisition is a
//! compare-and-set: the write only succeeds if the stored pair still looks
//! free at `now` (no owner, or an expired one). Contention is reported, not
//! waited on; callers skip to the next candidate. A crashed holder needs no
//! recovery code because its lease simply stops being live.
//!
//! The same predicate is used for work item leases and for idempotency key
//! holds, and both ledger backends evaluate it identically (the Postgres
//! backend encodes it in the `WHERE` clause of its `UPDATE`).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::work::Status;

/// Identity of a lease holder (a relay worker or the reconciler).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// A process-unique id with a readable prefix, e.g. `relay-3f2a9c1b`.
    pub fn unique(prefix: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{prefix}-{}", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A lease as stored on a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub owner: WorkerId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn is_held_by(&self, owner: &WorkerId, now: DateTime<Utc>) -> bool {
        &self.owner == owner && self.is_live(now)
    }
}

/// The new value a compare-and-set tries to install.
#[derive(Debug, Clone)]
pub struct LeaseClaim {
    pub owner: WorkerId,
    pub now: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseClaim {
    pub fn new(owner: WorkerId, now: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            owner,
            now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Compare step of the CAS: is a record holding `current` free for us?
    ///
    /// Re-acquiring our own lease is allowed so a worker can renew it.
    pub fn can_replace(&self, current: Option<&Lease>) -> bool {
        match current {
            None => true,
            Some(lease) => lease.owner == self.owner || !lease.is_live(self.now),
        }
    }
}

/// Is a work item in a state a worker may lease at `now`?
///
/// Queued items are leasable once their backoff has elapsed. Items still in
/// `processing` are leasable only after their holder's lease has expired.
pub fn work_is_leasable(
    status: Status,
    lease: Option<&Lease>,
    next_attempt_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    let lease_free = lease.is_none_or(|l| !l.is_live(now));
    match status {
        Status::Queued => lease_free && next_attempt_at.is_none_or(|t| t <= now),
        Status::Processing => lease.is_some_and(|l| !l.is_live(now)),
        _ => false,
    }
}
