//! Work item operations: ingestion with dedup, lease CAS, outcome
//! transitions guarded by the lease owner.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lease::{LeaseClaim, WorkerId};
use crate::model::outbox::OutboxId;
use crate::model::work::*;

/// Columns selected for every `WorkItemRow`.
macro_rules! work_columns {
    () => {
        "id, business_key, source_event_id, status, retry_count, lease_owner, lease_expires_at, \
         next_attempt_at, stall_count, payload_ref, last_error, created_at, updated_at, started_at, completed_at"
    };
}

/// SQL form of `lease::work_is_leasable` at time `$now`.
macro_rules! leasable_at {
    ($now:literal) => {
        concat!(
            "((status = 'queued' AND (lease_owner IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= ",
            $now,
            ") AND (next_attempt_at IS NULL OR next_attempt_at <= ",
            $now,
            ")) OR (status = 'processing' AND lease_owner IS NOT NULL AND lease_expires_at <= ",
            $now,
            "))"
        )
    };
}

impl super::Db {
    /// Insert a `received` work item unless its source event was seen.
    pub async fn insert_work_item(&self, new: NewWorkItem, now: DateTime<Utc>) -> Result<IngestResult> {
        let item = new.into_item(now);

        let inserted: Option<WorkItemRow> = sqlx::query_as(concat!(
            "INSERT INTO work_items (id, business_key, source_event_id, status, created_at, updated_at)
             VALUES ($1, $2, $3, 'received', $4, $4)
             ON CONFLICT (source_event_id) DO NOTHING
             RETURNING ",
            work_columns!()
        ))
        .bind(item.id.0)
        .bind(&item.business_key)
        .bind(&item.source_event_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(IngestResult::Created(Box::new(row.try_into_work_item()?)));
        }

        let existing: (Uuid,) = sqlx::query_as("SELECT id FROM work_items WHERE source_event_id = $1")
            .bind(&item.source_event_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(IngestResult::Duplicate {
            existing: WorkId(existing.0),
        })
    }

    /// Get a work item by ID.
    pub async fn get_work_item(&self, id: WorkId) -> Result<WorkItem> {
        let row: Option<WorkItemRow> =
            sqlx::query_as(concat!("SELECT ", work_columns!(), " FROM work_items WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("work item {id}")))?
            .try_into_work_item()
    }

    pub async fn leasable_candidates(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkId>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(concat!(
            "SELECT id FROM work_items WHERE ",
            leasable_at!("$1"),
            " ORDER BY created_at, id LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| WorkId(id)).collect())
    }

    /// Lease CAS: a single `UPDATE` whose `WHERE` re-checks leasability, so
    /// of two concurrent callers exactly one sees a row come back.
    pub async fn try_acquire_lease(&self, id: WorkId, claim: &LeaseClaim) -> Result<Option<WorkItem>> {
        let row: Option<WorkItemRow> = sqlx::query_as(concat!(
            "UPDATE work_items
             SET status = 'processing', lease_owner = $2, lease_expires_at = $3,
                 next_attempt_at = NULL, started_at = $4, updated_at = $4
             WHERE id = $1 AND ",
            leasable_at!("$4"),
            " RETURNING ",
            work_columns!()
        ))
        .bind(id.0)
        .bind(claim.owner.as_str())
        .bind(claim.expires_at)
        .bind(claim.now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkItemRow::try_into_work_item).transpose()
    }

    /// `processing → completed`. Marks the outbox record delivered and
    /// advances the sync baseline in the same transaction.
    pub async fn complete_work(
        &self,
        id: WorkId,
        owner: &WorkerId,
        baseline: crate::ledger::SyncBaseline,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let mut tx = self.pool.begin().await?;

        let row: Option<WorkItemRow> = sqlx::query_as(concat!(
            "UPDATE work_items
             SET status = 'completed', completed_at = $3, updated_at = $3, last_error = NULL,
                 lease_owner = NULL, lease_expires_at = NULL
             WHERE id = $1 AND status = 'processing' AND lease_owner = $2
             RETURNING ",
            work_columns!()
        ))
        .bind(id.0)
        .bind(owner.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(self.lease_lost_or_missing(id).await);
        };
        let item = row.try_into_work_item()?;

        if let Some(outbox_id) = item.payload_ref {
            sqlx::query(
                "UPDATE outbox_records SET delivered_at = COALESCE(delivered_at, $2) WHERE id = $1",
            )
            .bind(outbox_id.0)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        Self::upsert_baseline(&mut *tx, &baseline).await?;

        tx.commit().await?;

        Ok(item)
    }

    /// `processing → queued` with backoff.
    pub async fn schedule_retry(
        &self,
        id: WorkId,
        owner: &WorkerId,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let row: Option<WorkItemRow> = sqlx::query_as(concat!(
            "UPDATE work_items
             SET status = 'queued', retry_count = $3, next_attempt_at = $4, last_error = $5,
                 updated_at = $6, lease_owner = NULL, lease_expires_at = NULL
             WHERE id = $1 AND status = 'processing' AND lease_owner = $2
             RETURNING ",
            work_columns!()
        ))
        .bind(id.0)
        .bind(owner.as_str())
        .bind(retry_count as i32)
        .bind(next_attempt_at)
        .bind(error)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into_work_item(),
            None => Err(self.lease_lost_or_missing(id).await),
        }
    }

    /// `processing → failed`.
    pub async fn fail_work(
        &self,
        id: WorkId,
        owner: &WorkerId,
        retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let row: Option<WorkItemRow> = sqlx::query_as(concat!(
            "UPDATE work_items
             SET status = 'failed', retry_count = $3, last_error = $4, completed_at = $5,
                 updated_at = $5, lease_owner = NULL, lease_expires_at = NULL
             WHERE id = $1 AND status = 'processing' AND lease_owner = $2
             RETURNING ",
            work_columns!()
        ))
        .bind(id.0)
        .bind(owner.as_str())
        .bind(retry_count as i32)
        .bind(error)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into_work_item(),
            None => Err(self.lease_lost_or_missing(id).await),
        }
    }

    /// Operator reset to `queued`. Clears any lease, live or not.
    pub async fn reset_to_queued(&self, id: WorkId, now: DateTime<Utc>) -> Result<WorkItem> {
        let row: Option<WorkItemRow> = sqlx::query_as(concat!(
            "UPDATE work_items
             SET status = 'queued', retry_count = retry_count + 1, next_attempt_at = NULL,
                 completed_at = NULL, updated_at = $2, lease_owner = NULL, lease_expires_at = NULL
             WHERE id = $1 AND payload_ref IS NOT NULL
               AND status IN ('queued', 'processing', 'failed', 'completed')
             RETURNING ",
            work_columns!()
        ))
        .bind(id.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into_work_item(),
            None => {
                let current = self.get_work_item(id).await?;
                Err(Error::InvalidTransition {
                    from: current.status,
                    to: Status::Queued,
                })
            }
        }
    }

    /// Items in `processing` since before `started_before` whose lease is
    /// not live at `now`.
    pub async fn stalled_candidates(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(concat!(
            "SELECT ",
            work_columns!(),
            " FROM work_items
             WHERE status = 'processing' AND started_at < $1
               AND (lease_owner IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= $2)
             ORDER BY started_at, id"
        ))
        .bind(started_before)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkItemRow::try_into_work_item).collect()
    }

    pub async fn requeue_stalled(&self, id: WorkId, now: DateTime<Utc>) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE work_items
             SET status = 'queued', stall_count = stall_count + 1, next_attempt_at = NULL,
                 updated_at = $2, lease_owner = NULL, lease_expires_at = NULL
             WHERE id = $1 AND status = 'processing'
               AND (lease_owner IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= $2)",
        )
        .bind(id.0)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Items that reached `completed` or `failed` in `[start, end)`.
    pub async fn terminal_in_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(concat!(
            "SELECT ",
            work_columns!(),
            " FROM work_items
             WHERE status IN ('completed', 'failed') AND completed_at >= $1 AND completed_at < $2
             ORDER BY completed_at, id"
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkItemRow::try_into_work_item).collect()
    }

    /// A guarded update matched nothing: either the row is gone or the
    /// caller's lease is.
    async fn lease_lost_or_missing(&self, id: WorkId) -> Error {
        let exists: std::result::Result<(bool,), sqlx::Error> =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM work_items WHERE id = $1)")
                .bind(id.0)
                .fetch_one(&self.pool)
                .await;
        match exists {
            Ok((true,)) => Error::LeaseLost(id),
            Ok((false,)) => Error::NotFound(format!("work item {id}")),
            Err(e) => e.into(),
        }
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
pub(super) struct WorkItemRow {
    id: Uuid,
    business_key: String,
    source_event_id: Option<String>,
    status: String,
    retry_count: i32,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    stall_count: i32,
    payload_ref: Option<Uuid>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl WorkItemRow {
    pub(super) fn try_into_work_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: WorkId(self.id),
            business_key: self.business_key,
            source_event_id: self.source_event_id,
            status: self.status.parse()?,
            retry_count: self.retry_count.max(0) as u32,
            lease_owner: self.lease_owner,
            lease_expires_at: self.lease_expires_at,
            next_attempt_at: self.next_attempt_at,
            stall_count: self.stall_count.max(0) as u32,
            payload_ref: self.payload_ref.map(OutboxId),
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}
