//! EnrichmentWorker: background consumer of the enrichment queue.
//!
//! Each cycle the worker returns stale `processing` entries to `pending`,
//! claims a batch of due entries and searches the external service for each
//! name. There is no per-run budget here; the client's own rate limit and
//! circuit breaker apply.
//!
//! ## Outcomes
//!
//! - Match above threshold: mappings are backflowed, entry `done` with the id
//! - No match: entry `done` without an id
//! - Circuit open: entry released back to `pending`, no attempt counted
//! - Transient failure: attempt counted, rescheduled with backoff, `failed`
//!   at the attempt ceiling
//! - Permanent failure: straight to `failed`

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backflow::{BackflowCandidate, BackflowReport, BackflowWriter};
use crate::config::EnrichmentConfig;
use crate::error::QueueError;
use crate::external::{best_match, Candidate, ExponentialBackoff, ExternalLookup};
use crate::queue::{EnrichmentQueue, FailureDisposition};
use crate::types::{CacheSource, LookupType, QueueEntry, QueueStatus};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub max_attempts: i32,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub min_match_score: f64,
    /// Delay before a transiently failed entry becomes due again.
    pub retry_backoff: ExponentialBackoff,
}

impl WorkerSettings {
    pub fn from_config(config: &EnrichmentConfig) -> Self {
        Self {
            batch_size: config.queue.batch_size.max(1),
            max_attempts: config.queue.max_attempts.max(1),
            poll_interval: config.queue.poll_interval(),
            stale_after: config.queue.stale_after(),
            min_match_score: config.min_match_score,
            retry_backoff: ExponentialBackoff::new(
                Duration::from_secs(config.queue.backoff_base_secs),
                Duration::from_secs(config.queue.backoff_max_secs),
            ),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&EnrichmentConfig::default())
    }
}

/// Counts for one `process_batch` cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub claimed: usize,
    pub resolved: usize,
    pub no_match: usize,
    pub retried: usize,
    pub failed: usize,
    pub released: usize,
    pub backflow: BackflowReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Resolved,
    NoMatch,
    Retried,
    Failed,
    Released,
    /// The queue rejected the transition; the entry is left for stale reset.
    Untracked,
}

// ---------------------------------------------------------------------------
// EnrichmentWorker
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EnrichmentWorker {
    worker_id: usize,
    queue: Arc<dyn EnrichmentQueue>,
    client: Arc<dyn ExternalLookup>,
    writer: Arc<BackflowWriter>,
    settings: WorkerSettings,
}

impl EnrichmentWorker {
    pub fn new(
        queue: Arc<dyn EnrichmentQueue>,
        client: Arc<dyn ExternalLookup>,
        writer: Arc<BackflowWriter>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            worker_id: 0,
            queue,
            client,
            writer,
            settings,
        }
    }

    pub fn with_worker_id(mut self, worker_id: usize) -> Self {
        self.worker_id = worker_id;
        self
    }

    /// Start `count` independent workers sharing the queue, client and
    /// writer. Each stops when `shutdown_rx` flips to true.
    pub fn spawn_workers(&self, count: usize, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|id| {
                let worker = self.clone().with_worker_id(id);
                let rx = shutdown_rx.clone();
                tokio::spawn(async move { worker.run(rx).await })
            })
            .collect()
    }

    /// Run the worker loop until the shutdown signal is received.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(worker_id = self.worker_id, "EnrichmentWorker started");

        loop {
            if *shutdown_rx.borrow() {
                tracing::info!(worker_id = self.worker_id, "EnrichmentWorker shutting down");
                break;
            }

            self.reset_stale().await;

            let drained = match self.process_batch().await {
                Ok(report) => report.claimed >= self.settings.batch_size,
                Err(e) => {
                    tracing::warn!(
                        worker_id = self.worker_id,
                        error = %e,
                        "EnrichmentWorker: failed to claim queue entries"
                    );
                    false
                }
            };
            // A full batch means more work is probably waiting.
            if drained {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = shutdown_rx.changed() => {
                    tracing::info!(worker_id = self.worker_id, "EnrichmentWorker shutting down (during sleep)");
                    break;
                }
            }
        }

        tracing::info!(worker_id = self.worker_id, "EnrichmentWorker stopped");
    }

    async fn reset_stale(&self) {
        match self.queue.reset_stale(self.settings.stale_after).await {
            Ok(0) => {}
            Ok(n) => tracing::warn!(
                worker_id = self.worker_id,
                reset = n,
                "EnrichmentWorker: returned stale processing entries to pending"
            ),
            Err(e) => tracing::warn!(
                worker_id = self.worker_id,
                error = %e,
                "EnrichmentWorker: stale reset failed"
            ),
        }
    }

    /// Claim one batch and process every entry in it.
    pub async fn process_batch(&self) -> Result<ProcessReport, QueueError> {
        let entries = self.queue.claim_batch(self.settings.batch_size).await?;
        let mut report = ProcessReport {
            claimed: entries.len(),
            ..ProcessReport::default()
        };
        if entries.is_empty() {
            return Ok(report);
        }

        tracing::debug!(
            worker_id = self.worker_id,
            count = entries.len(),
            "EnrichmentWorker: processing queue entries"
        );

        for entry in &entries {
            match self.process_entry(entry, &mut report.backflow).await {
                EntryOutcome::Resolved => report.resolved += 1,
                EntryOutcome::NoMatch => report.no_match += 1,
                EntryOutcome::Retried => report.retried += 1,
                EntryOutcome::Failed => report.failed += 1,
                EntryOutcome::Released => report.released += 1,
                EntryOutcome::Untracked => {}
            }
        }

        tracing::info!(
            worker_id = self.worker_id,
            claimed = report.claimed,
            resolved = report.resolved,
            no_match = report.no_match,
            retried = report.retried,
            failed = report.failed,
            released = report.released,
            "EnrichmentWorker: batch complete"
        );
        Ok(report)
    }

    async fn process_entry(&self, entry: &QueueEntry, backflow: &mut BackflowReport) -> EntryOutcome {
        let query = if entry.raw_name.trim().is_empty() {
            entry.normalized_name.as_str()
        } else {
            entry.raw_name.as_str()
        };

        let candidates = match self.client.search_by_name(query).await {
            Ok(candidates) => candidates,
            Err(e) if e.is_circuit_open() => {
                return match self.queue.release(entry.id).await {
                    Ok(()) => EntryOutcome::Released,
                    Err(qe) => self.untracked(entry, &qe),
                };
            }
            Err(e) if e.is_transient() => return self.retry(entry, &e.to_string()).await,
            Err(e) => return self.fail_permanently(entry, &e.to_string()).await,
        };

        let Some(top) = best_match(&candidates, self.settings.min_match_score) else {
            return match self.queue.mark_done(entry.id, None).await {
                Ok(()) => {
                    tracing::info!(
                        id = entry.id,
                        name = %entry.normalized_name,
                        candidates = candidates.len(),
                        "EnrichmentWorker: no match above threshold"
                    );
                    EntryOutcome::NoMatch
                }
                Err(qe) => self.untracked(entry, &qe),
            };
        };

        // Learn before marking done so a failed write is retried.
        match self.writer.record_batch(&learned_mappings(entry, top)).await {
            Ok(written) => backflow.merge(&written),
            Err(e) => return self.retry(entry, &format!("backflow failed: {e}")).await,
        }

        match self.queue.mark_done(entry.id, Some(&top.company_id)).await {
            Ok(()) => {
                tracing::info!(
                    id = entry.id,
                    name = %entry.normalized_name,
                    company_id = %top.company_id,
                    score = top.score,
                    attempts = entry.attempts + 1,
                    "EnrichmentWorker: resolved queued name"
                );
                EntryOutcome::Resolved
            }
            Err(qe) => self.untracked(entry, &qe),
        }
    }

    async fn retry(&self, entry: &QueueEntry, error: &str) -> EntryOutcome {
        let attempt = u32::try_from(entry.attempts.max(0)).unwrap_or(u32::MAX).saturating_add(1);
        let delay = self.settings.retry_backoff.delay_for_attempt(attempt);
        let retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        let disposition = FailureDisposition::Retry {
            max_attempts: self.settings.max_attempts,
            retry_at,
        };
        match self.queue.record_failure(entry.id, error, disposition).await {
            Ok(QueueStatus::Failed) => {
                tracing::warn!(
                    id = entry.id,
                    name = %entry.normalized_name,
                    attempts = entry.attempts + 1,
                    error,
                    "EnrichmentWorker: entry permanently failed after max attempts"
                );
                EntryOutcome::Failed
            }
            Ok(_) => {
                tracing::debug!(
                    id = entry.id,
                    attempts = entry.attempts + 1,
                    retry_in_secs = delay.as_secs(),
                    error,
                    "EnrichmentWorker: will retry"
                );
                EntryOutcome::Retried
            }
            Err(qe) => self.untracked(entry, &qe),
        }
    }

    async fn fail_permanently(&self, entry: &QueueEntry, error: &str) -> EntryOutcome {
        match self
            .queue
            .record_failure(entry.id, error, FailureDisposition::Permanent)
            .await
        {
            Ok(_) => {
                tracing::warn!(
                    id = entry.id,
                    name = %entry.normalized_name,
                    error,
                    "EnrichmentWorker: entry failed permanently"
                );
                EntryOutcome::Failed
            }
            Err(qe) => self.untracked(entry, &qe),
        }
    }

    fn untracked(&self, entry: &QueueEntry, error: &QueueError) -> EntryOutcome {
        tracing::error!(
            worker_id = self.worker_id,
            id = entry.id,
            error = %error,
            "EnrichmentWorker: failed to update queue entry"
        );
        EntryOutcome::Untracked
    }
}

/// Mappings confirmed by an external match for a queued name.
fn learned_mappings(entry: &QueueEntry, top: &Candidate) -> Vec<BackflowCandidate> {
    let mapping = |lookup_type: LookupType, key: &str| {
        BackflowCandidate::new(
            lookup_type,
            key,
            top.company_id.as_str(),
            CacheSource::ExternalApi,
            top.score,
        )
    };

    // The queued name is learned under the field it was read from.
    let mut mappings = vec![
        mapping(entry.lookup_type, &entry.raw_name),
        mapping(LookupType::CustomerName, &top.official_name),
    ];
    mappings.extend(
        top.aliases
            .iter()
            .map(|alias| mapping(LookupType::FormerName, alias)),
    );
    mappings
}
