//! Postgres-backed enrichment queue.
//!
//! Idempotency: a partial UNIQUE index on `normalized_name WHERE status IN
//! ('pending', 'processing', 'failed')` prevents duplicate open entries.
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never receive
//! the same row.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{EnrichmentQueue, FailureDisposition};
use crate::error::QueueError;
use crate::types::{LookupType, NewQueueEntry, QueueEntry, QueueStats, QueueStatus};

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    id: i64,
    raw_name: String,
    normalized_name: String,
    lookup_type: String,
    temp_id: Option<String>,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    resolved_company_id: Option<String>,
    next_attempt_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl QueueRow {
    fn into_entry(self) -> QueueEntry {
        let status = QueueStatus::parse(&self.status).unwrap_or_else(|| {
            tracing::warn!(id = self.id, status = %self.status, "Unknown queue status, treating as failed");
            QueueStatus::Failed
        });
        let lookup_type = LookupType::parse(&self.lookup_type).unwrap_or_else(|| {
            tracing::warn!(
                id = self.id,
                lookup_type = %self.lookup_type,
                "Unknown queue lookup type, treating as customer name"
            );
            LookupType::CustomerName
        });
        QueueEntry {
            id: self.id,
            raw_name: self.raw_name,
            normalized_name: self.normalized_name,
            lookup_type,
            temp_id: self.temp_id,
            status,
            attempts: self.attempts,
            last_error: self.last_error,
            resolved_company_id: self.resolved_company_id,
            next_attempt_at: self.next_attempt_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

const RETURNING_COLUMNS: &str = "id, raw_name, normalized_name, lookup_type, temp_id, status, attempts, \
     last_error, resolved_company_id, next_attempt_at, created_at, updated_at";

/// Postgres store for `enrichment.company_enrichment_queue`.
#[derive(Clone)]
pub struct PgEnrichmentQueue {
    pool: PgPool,
}

impl PgEnrichmentQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EnrichmentQueue for PgEnrichmentQueue {
    async fn enqueue_batch(&self, entries: &[NewQueueEntry]) -> Result<usize, QueueError> {
        let entries: Vec<&NewQueueEntry> = entries
            .iter()
            .filter(|e| !e.normalized_name.is_empty())
            .collect();
        if entries.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO enrichment.company_enrichment_queue
                (raw_name, normalized_name, lookup_type, temp_id, status, attempts,
                 next_attempt_at, created_at, updated_at)
            SELECT t.raw_name, t.normalized_name, t.lookup_type, t.temp_id, 'pending', 0,
                   now(), now(), now()
            FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[])
                AS t(raw_name, normalized_name, lookup_type, temp_id)
            ON CONFLICT (normalized_name) WHERE status IN ('pending', 'processing', 'failed')
            DO NOTHING
            "#,
        )
        .bind(entries.iter().map(|e| e.raw_name.clone()).collect::<Vec<_>>())
        .bind(entries.iter().map(|e| e.normalized_name.clone()).collect::<Vec<_>>())
        .bind(entries.iter().map(|e| e.lookup_type.as_str().to_string()).collect::<Vec<_>>())
        .bind(entries.iter().map(|e| e.temp_id.clone()).collect::<Vec<_>>())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
        let sql = format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM enrichment.company_enrichment_queue
                WHERE status = 'pending'
                  AND next_attempt_at <= now()
                ORDER BY created_at ASC, id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE enrichment.company_enrichment_queue q
            SET status = 'processing', updated_at = now()
            FROM claimable c
            WHERE q.id = c.id
            RETURNING {}
            "#,
            RETURNING_COLUMNS
                .split(", ")
                .map(|c| format!("q.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let rows = sqlx::query_as::<_, QueueRow>(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut entries: Vec<QueueEntry> = rows.into_iter().map(QueueRow::into_entry).collect();
        entries.sort_by_key(|e| (e.created_at, e.id));
        Ok(entries)
    }

    async fn mark_done(&self, id: i64, resolved_company_id: Option<&str>) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE enrichment.company_enrichment_queue
            SET status = 'done',
                resolved_company_id = $2,
                updated_at = now()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(resolved_company_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::InvalidTransition {
                id,
                expected: QueueStatus::Processing.as_str(),
            });
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        id: i64,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<QueueStatus, QueueError> {
        let (permanent, max_attempts, retry_at) = match disposition {
            FailureDisposition::Permanent => (true, 0, Utc::now()),
            FailureDisposition::Retry {
                max_attempts,
                retry_at,
            } => (false, max_attempts, retry_at),
        };

        let status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE enrichment.company_enrichment_queue
            SET attempts = attempts + 1,
                last_error = $2,
                next_attempt_at = $5,
                updated_at = now(),
                status = CASE
                    WHEN $3 OR attempts + 1 >= $4 THEN 'failed'
                    ELSE 'pending'
                END
            WHERE id = $1 AND status = 'processing'
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(permanent)
        .bind(max_attempts)
        .bind(retry_at)
        .fetch_optional(&self.pool)
        .await?;

        let status = status.ok_or(QueueError::InvalidTransition {
            id,
            expected: QueueStatus::Processing.as_str(),
        })?;
        QueueStatus::parse(&status)
            .ok_or_else(|| QueueError::Backend(format!("unexpected status '{status}'")))
    }

    async fn release(&self, id: i64) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE enrichment.company_enrichment_queue
            SET status = 'pending', updated_at = now()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::InvalidTransition {
                id,
                expected: QueueStatus::Processing.as_str(),
            });
        }
        Ok(())
    }

    async fn reset_stale(&self, older_than: Duration) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE enrichment.company_enrichment_queue
            SET status = 'pending', updated_at = now()
            WHERE status = 'processing'
              AND updated_at < now() - make_interval(secs => $1::double precision)
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn requeue_failed(&self) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE enrichment.company_enrichment_queue
            SET status = 'pending', attempts = 0, next_attempt_at = now(), updated_at = now()
            WHERE status = 'failed'
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
        let sql = format!(
            r#"
            SELECT {RETURNING_COLUMNS}
            FROM enrichment.company_enrichment_queue
            WHERE status = 'failed'
            ORDER BY updated_at DESC
            LIMIT $1
            "#
        );
        let rows = sqlx::query_as::<_, QueueRow>(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(QueueRow::into_entry).collect())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM enrichment.company_enrichment_queue
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match QueueStatus::parse(&status) {
                Some(QueueStatus::Pending) => stats.pending = count,
                Some(QueueStatus::Processing) => stats.processing = count,
                Some(QueueStatus::Done) => stats.done = count,
                Some(QueueStatus::Failed) => stats.failed = count,
                None => tracing::warn!(status = %status, "Unknown queue status in store"),
            }
        }
        Ok(stats)
    }
}
