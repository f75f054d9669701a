//! Replica collections stored as JSONB documents in Postgres.
//!
//! Each upsert reads the document under a row lock, applies the owned-field
//! merge in Rust and writes the body back, so fields owned by other writers
//! of the same row are preserved even when they write concurrently.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::PgPool;

use super::{FieldOwnership, OwnedSnapshot, OwnedWrite, Replica, ReplicaError, WriteAck, merge_owned, owned_view};

pub struct PgReplica {
    pool: PgPool,
}

impl PgReplica {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the documents table if it does not exist yet.
    pub async fn ensure_schema(&self) -> crate::error::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS replica_documents (
                 collection   TEXT NOT NULL,
                 business_key TEXT NOT NULL,
                 body         JSONB NOT NULL DEFAULT '{}'::jsonb,
                 updated_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
                 PRIMARY KEY (collection, business_key)
             )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Connection-level failures are transient, and so are the SQLSTATEs that
/// report contention or a server that is going away. Anything else the
/// database rejects about the statement or the data is permanent.
fn classify(e: sqlx::Error) -> ReplicaError {
    match e {
        sqlx::Error::Database(db) => {
            let message = db.to_string();
            match db.code() {
                Some(code) if transient_sqlstate(&code) => ReplicaError::Unavailable(message),
                _ => ReplicaError::InvalidPayload(message),
            }
        }
        other => ReplicaError::Unavailable(other.to_string()),
    }
}

fn transient_sqlstate(code: &str) -> bool {
    match code {
        // lock_not_available, query_canceled (statement timeout)
        "55P03" | "57014" => true,
        // admin/crash shutdown, cannot connect now
        c if c.starts_with("57P") => true,
        // connection exception, transaction rollback, insufficient resources
        c => c.starts_with("08") || c.starts_with("40") || c.starts_with("53"),
    }
}

#[async_trait]
impl Replica for PgReplica {
    async fn upsert_owned(&self, write: &OwnedWrite) -> Result<WriteAck, ReplicaError> {
        write.validate()?;
        let collection = &write.payload.collection;
        let key = &write.payload.business_key;

        let mut tx = self.pool.begin().await.map_err(classify)?;

        sqlx::query(
            "INSERT INTO replica_documents (collection, business_key) VALUES ($1, $2)
             ON CONFLICT (collection, business_key) DO NOTHING",
        )
        .bind(collection)
        .bind(key)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        let (body,): (Value,) = sqlx::query_as(
            "SELECT body FROM replica_documents WHERE collection = $1 AND business_key = $2 FOR UPDATE",
        )
        .bind(collection)
        .bind(key)
        .fetch_one(&mut *tx)
        .await
        .map_err(classify)?;

        let mut document: Map<String, Value> = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let ack = merge_owned(&mut document, write);

        if ack.written {
            sqlx::query(
                "UPDATE replica_documents SET body = $3, updated_at = now()
                 WHERE collection = $1 AND business_key = $2",
            )
            .bind(collection)
            .bind(key)
            .bind(Value::Object(document))
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }

        tx.commit().await.map_err(classify)?;
        Ok(ack)
    }

    async fn read_owned(
        &self,
        collection: &str,
        business_key: &str,
        ownership: &FieldOwnership,
    ) -> Result<Option<OwnedSnapshot>, ReplicaError> {
        let row: Option<(Value,)> = sqlx::query_as(
            "SELECT body FROM replica_documents WHERE collection = $1 AND business_key = $2",
        )
        .bind(collection)
        .bind(business_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.map(|(body,)| match body {
            Value::Object(document) => owned_view(&document, ownership),
            _ => owned_view(&Map::new(), ownership),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::transient_sqlstate;

    #[test]
    fn contention_and_outages_are_transient() {
        for code in ["55P03", "40P01", "40001", "53300", "57P01", "57P03", "57014", "08006"] {
            assert!(transient_sqlstate(code), "{code} should be transient");
        }
    }

    #[test]
    fn data_and_constraint_errors_are_permanent() {
        for code in ["22P02", "22001", "23505", "23502", "42P01", "55000"] {
            assert!(!transient_sqlstate(code), "{code} should be permanent");
        }
    }
}
