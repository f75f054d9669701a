//! Idempotency key holds and outcomes.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::lease::{LeaseClaim, WorkerId};
use crate::model::idempotency::{IdempotencyKey, KeyClaim, RecordedOutcome};

impl super::Db {
    /// Take the hold on `key` with the same CAS rule as work leases: the
    /// upsert only overwrites an unsettled row whose hold is free.
    pub async fn claim_idempotency_key(&self, key: &IdempotencyKey, claim: &LeaseClaim) -> Result<KeyClaim> {
        let acquired: Option<(String,)> = sqlx::query_as(
            "INSERT INTO idempotency_keys (key, first_seen_at, holder, hold_expires_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (key) DO UPDATE
             SET holder = EXCLUDED.holder, hold_expires_at = EXCLUDED.hold_expires_at
             WHERE idempotency_keys.outcome IS NULL
               AND (idempotency_keys.holder IS NULL
                    OR idempotency_keys.holder = EXCLUDED.holder
                    OR idempotency_keys.hold_expires_at IS NULL
                    OR idempotency_keys.hold_expires_at <= $2)
             RETURNING key",
        )
        .bind(key.as_str())
        .bind(claim.now)
        .bind(claim.owner.as_str())
        .bind(claim.expires_at)
        .fetch_optional(&self.pool)
        .await?;

        if acquired.is_some() {
            return Ok(KeyClaim::Acquired);
        }

        let existing: Option<(Option<Value>, Option<String>)> =
            sqlx::query_as("SELECT outcome, holder FROM idempotency_keys WHERE key = $1")
                .bind(key.as_str())
                .fetch_optional(&self.pool)
                .await?;

        match existing {
            Some((Some(outcome), _)) => Ok(KeyClaim::Settled(serde_json::from_value(outcome)?)),
            Some((None, holder)) => Ok(KeyClaim::Busy {
                holder: holder.unwrap_or_default(),
            }),
            // Released between the two statements; the caller retries.
            None => Ok(KeyClaim::Busy {
                holder: String::new(),
            }),
        }
    }

    /// First outcome wins; returns whichever is stored.
    pub async fn settle_idempotency_key(
        &self,
        key: &IdempotencyKey,
        _owner: &WorkerId,
        outcome: RecordedOutcome,
        now: DateTime<Utc>,
    ) -> Result<RecordedOutcome> {
        let (stored,): (Value,) = sqlx::query_as(
            "INSERT INTO idempotency_keys (key, first_seen_at, outcome)
             VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE
             SET outcome = COALESCE(idempotency_keys.outcome, EXCLUDED.outcome),
                 holder = NULL, hold_expires_at = NULL
             RETURNING outcome",
        )
        .bind(key.as_str())
        .bind(now)
        .bind(serde_json::to_value(&outcome)?)
        .fetch_one(&self.pool)
        .await?;

        Ok(serde_json::from_value(stored)?)
    }

    pub async fn release_idempotency_key(&self, key: &IdempotencyKey, owner: &WorkerId) -> Result<()> {
        sqlx::query(
            "DELETE FROM idempotency_keys WHERE key = $1 AND holder = $2 AND outcome IS NULL",
        )
        .bind(key.as_str())
        .bind(owner.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
