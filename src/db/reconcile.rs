//! Sync baselines and reconciliation reports.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ledger::SyncBaseline;
use crate::model::report::ReconciliationReport;

impl super::Db {
    pub async fn sync_baseline(&self, business_key: &str) -> Result<Option<SyncBaseline>> {
        let row: Option<(String, String, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT business_key, synced_hash, synced_version, synced_at
             FROM replica_sync WHERE business_key = $1",
        )
        .bind(business_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(business_key, synced_hash, synced_version, synced_at)| SyncBaseline {
                business_key,
                synced_hash,
                synced_version: synced_version as u64,
                synced_at,
            },
        ))
    }

    pub async fn record_sync_baseline(&self, baseline: SyncBaseline) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::upsert_baseline(&mut *conn, &baseline).await
    }

    /// Never moves a baseline to an older version.
    pub(super) async fn upsert_baseline(conn: &mut sqlx::PgConnection, baseline: &SyncBaseline) -> Result<()> {
        sqlx::query(
            "INSERT INTO replica_sync (business_key, synced_hash, synced_version, synced_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (business_key) DO UPDATE
             SET synced_hash = EXCLUDED.synced_hash,
                 synced_version = EXCLUDED.synced_version,
                 synced_at = EXCLUDED.synced_at
             WHERE replica_sync.synced_version <= EXCLUDED.synced_version",
        )
        .bind(&baseline.business_key)
        .bind(&baseline.synced_hash)
        .bind(baseline.synced_version as i64)
        .bind(baseline.synced_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn append_report(&self, report: &ReconciliationReport) -> Result<()> {
        sqlx::query(
            "INSERT INTO reconciliation_reports
                 (run_id, window_start, window_end, counts, skipped, findings, health_score, generated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(report.run_id)
        .bind(report.window_start)
        .bind(report.window_end)
        .bind(serde_json::to_value(report.counts)?)
        .bind(report.skipped as i32)
        .bind(serde_json::to_value(&report.findings)?)
        .bind(report.health_score)
        .bind(report.generated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_report(&self, run_id: Uuid) -> Result<ReconciliationReport> {
        let row: Option<ReportRow> = sqlx::query_as(
            "SELECT run_id, window_start, window_end, counts, skipped, findings, health_score, generated_at
             FROM reconciliation_reports WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("reconciliation report {run_id}")))?
            .try_into_report()
    }

    pub async fn list_reports(&self, limit: usize) -> Result<Vec<ReconciliationReport>> {
        let rows: Vec<ReportRow> = sqlx::query_as(
            "SELECT run_id, window_start, window_end, counts, skipped, findings, health_score, generated_at
             FROM reconciliation_reports ORDER BY generated_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ReportRow::try_into_report).collect()
    }
}

#[derive(sqlx::FromRow)]
struct ReportRow {
    run_id: Uuid,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    counts: Value,
    skipped: i32,
    findings: Value,
    health_score: f64,
    generated_at: DateTime<Utc>,
}

impl ReportRow {
    fn try_into_report(self) -> Result<ReconciliationReport> {
        Ok(ReconciliationReport {
            run_id: self.run_id,
            window_start: self.window_start,
            window_end: self.window_end,
            counts: serde_json::from_value(self.counts)?,
            skipped: self.skipped.max(0) as u32,
            findings: serde_json::from_value(self.findings)?,
            health_score: self.health_score,
            generated_at: self.generated_at,
        })
    }
}
