//! Outbox commit: aggregate mutation, outbox record and work item status in
//! one transaction.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ledger::Backlog;
use crate::model::outbox::*;
use crate::model::work::{Status, WorkId};

impl super::Db {
    pub async fn commit_mutation(&self, request: CommitRequest, now: DateTime<Utc>) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String, String)> =
            sqlx::query_as("SELECT business_key, status FROM work_items WHERE id = $1 FOR UPDATE")
                .bind(request.work_id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let (business_key, status) =
            current.ok_or_else(|| Error::NotFound(format!("work item {}", request.work_id)))?;
        let status: Status = status.parse()?;
        if status != Status::Received {
            return Err(Error::InvalidTransition {
                from: status,
                to: Status::Queued,
            });
        }

        // Make sure the row exists, then lock it; concurrent commits for the
        // same business key serialize here.
        sqlx::query(
            "INSERT INTO aggregates (business_key, state, version, updated_at)
             VALUES ($1, '{}'::jsonb, 0, $2)
             ON CONFLICT (business_key) DO NOTHING",
        )
        .bind(&business_key)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let (state, version): (Value, i64) = sqlx::query_as(
            "SELECT state, version FROM aggregates WHERE business_key = $1 FOR UPDATE",
        )
        .bind(&business_key)
        .fetch_one(&mut *tx)
        .await?;

        let mut state: Map<String, Value> = serde_json::from_value(state)?;
        request.mutation.apply_to(&mut state);
        let aggregate = Aggregate {
            business_key: business_key.clone(),
            state,
            version: version as u64 + 1,
            updated_at: now,
        };

        sqlx::query(
            "UPDATE aggregates SET state = $2, version = $3, updated_at = $4 WHERE business_key = $1",
        )
        .bind(&business_key)
        .bind(Value::Object(aggregate.state.clone()))
        .bind(aggregate.version as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let outbox = match &request.effect {
            Some(effect) => {
                let payload = DeliveryPayload::project(&aggregate, &effect.collection, &effect.fields);
                let record = OutboxRecord {
                    id: OutboxId::new(),
                    work_id: request.work_id,
                    aggregate_id: business_key.clone(),
                    operation: effect.operation,
                    payload: serde_json::to_value(&payload)?,
                    created_at: now,
                    delivered_at: None,
                    delivery_attempts: 0,
                };
                sqlx::query(
                    "INSERT INTO outbox_records (id, work_id, aggregate_id, operation, payload, created_at)
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(record.id.0)
                .bind(record.work_id.0)
                .bind(&record.aggregate_id)
                .bind(record.operation.as_str())
                .bind(&record.payload)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE work_items SET status = 'queued', payload_ref = $2, updated_at = $3 WHERE id = $1",
                )
                .bind(request.work_id.0)
                .bind(record.id.0)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                Some(record)
            }
            None => {
                sqlx::query(
                    "UPDATE work_items SET status = 'not_applicable', completed_at = $2, updated_at = $2 WHERE id = $1",
                )
                .bind(request.work_id.0)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                None
            }
        };

        tx.commit().await?;
        Ok(CommitOutcome { aggregate, outbox })
    }

    pub async fn get_outbox_record(&self, id: OutboxId) -> Result<OutboxRecord> {
        let row: Option<OutboxRow> = sqlx::query_as(
            "SELECT id, work_id, aggregate_id, operation, payload, created_at, delivered_at, delivery_attempts
             FROM outbox_records WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("outbox record {id}")))?
            .try_into_record()
    }

    pub async fn outbox_for_work(&self, id: WorkId) -> Result<Vec<OutboxRecord>> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            "SELECT id, work_id, aggregate_id, operation, payload, created_at, delivered_at, delivery_attempts
             FROM outbox_records WHERE work_id = $1 ORDER BY created_at",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OutboxRow::try_into_record).collect()
    }

    pub async fn get_aggregate(&self, business_key: &str) -> Result<Option<Aggregate>> {
        let row: Option<(String, Value, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT business_key, state, version, updated_at FROM aggregates
             WHERE business_key = $1 AND version > 0",
        )
        .bind(business_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(business_key, state, version, updated_at)| {
            Ok(Aggregate {
                business_key,
                state: serde_json::from_value(state)?,
                version: version as u64,
                updated_at,
            })
        })
        .transpose()
    }

    pub async fn record_delivery_attempt(&self, id: OutboxId) -> Result<u32> {
        let attempts: Option<(i32,)> = sqlx::query_as(
            "UPDATE outbox_records SET delivery_attempts = delivery_attempts + 1
             WHERE id = $1 RETURNING delivery_attempts",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        attempts
            .map(|(n,)| n.max(0) as u32)
            .ok_or_else(|| Error::NotFound(format!("outbox record {id}")))
    }

    pub async fn backlog(&self) -> Result<Backlog> {
        let (undelivered, oldest): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
            "SELECT count(*), min(created_at) FROM outbox_records WHERE delivered_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(Backlog {
            undelivered: undelivered.max(0) as u64,
            oldest_created_at: oldest,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    work_id: Uuid,
    aggregate_id: String,
    operation: String,
    payload: Value,
    created_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
    delivery_attempts: i32,
}

impl OutboxRow {
    fn try_into_record(self) -> Result<OutboxRecord> {
        Ok(OutboxRecord {
            id: OutboxId(self.id),
            work_id: WorkId(self.work_id),
            aggregate_id: self.aggregate_id,
            operation: self.operation.parse()?,
            payload: self.payload,
            created_at: self.created_at,
            delivered_at: self.delivered_at,
            delivery_attempts: self.delivery_attempts.max(0) as u32,
        })
    }
}
