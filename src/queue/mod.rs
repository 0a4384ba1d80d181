//! Enrichment queue: durable at-least-once work queue of unresolved names.
//!
//! The resolver enqueues; only the [`EnrichmentWorker`](crate::consumer::EnrichmentWorker)
//! claims and transitions entries.
//!
//! Idempotency: at most one open (`pending`, `processing` or `failed`) entry
//! exists per normalized name. A `failed` entry blocks re-enqueueing until an
//! operator requeues it.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::QueueError;
use crate::types::{NewQueueEntry, QueueEntry, QueueStats, QueueStatus};

pub use memory::InMemoryEnrichmentQueue;
#[cfg(feature = "database")]
pub use postgres::PgEnrichmentQueue;

/// How a failed attempt should be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Return to `pending` at `retry_at` unless `max_attempts` is reached.
    Retry {
        max_attempts: i32,
        retry_at: DateTime<Utc>,
    },
    /// Straight to `failed`.
    Permanent,
}

/// Status after a failed attempt is recorded.
pub(crate) fn status_after_failure(attempts_after: i32, disposition: FailureDisposition) -> QueueStatus {
    match disposition {
        FailureDisposition::Permanent => QueueStatus::Failed,
        FailureDisposition::Retry { max_attempts, .. } if attempts_after >= max_attempts => {
            QueueStatus::Failed
        }
        FailureDisposition::Retry { .. } => QueueStatus::Pending,
    }
}

#[async_trait]
pub trait EnrichmentQueue: Send + Sync {
    /// Enqueue names. Names that already have an open entry are skipped.
    /// Returns how many new entries were created.
    async fn enqueue_batch(&self, entries: &[NewQueueEntry]) -> Result<usize, QueueError>;

    /// Atomically claim up to `limit` due `pending` entries, oldest first,
    /// and flip them to `processing`. Concurrent claimers never receive the
    /// same entry.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError>;

    /// `processing -> done`. `None` records that the service had no match.
    async fn mark_done(&self, id: i64, resolved_company_id: Option<&str>) -> Result<(), QueueError>;

    /// Increment `attempts`, store `last_error`, and move the entry to
    /// `pending` or `failed`. Returns the new status.
    async fn record_failure(
        &self,
        id: i64,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<QueueStatus, QueueError>;

    /// `processing -> pending` without counting an attempt.
    async fn release(&self, id: i64) -> Result<(), QueueError>;

    /// Return entries stuck in `processing` for longer than `older_than` to
    /// `pending`. Returns how many were reset.
    async fn reset_stale(&self, older_than: Duration) -> Result<u64, QueueError>;

    /// Operator action: `failed -> pending` with attempts reset.
    async fn requeue_failed(&self) -> Result<u64, QueueError>;

    async fn list_failed(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}
