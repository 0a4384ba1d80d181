//! In-process enrichment queue.
//!
//! Claims happen under one mutex, which gives the same no-double-claim
//! guarantee as `FOR UPDATE SKIP LOCKED`.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{status_after_failure, EnrichmentQueue, FailureDisposition};
use crate::error::QueueError;
use crate::types::{NewQueueEntry, QueueEntry, QueueStats, QueueStatus};

#[derive(Debug, Default)]
struct QueueState {
    next_id: i64,
    entries: BTreeMap<i64, QueueEntry>,
}

#[derive(Debug, Default)]
pub struct InMemoryEnrichmentQueue {
    state: Mutex<QueueState>,
}

impl InMemoryEnrichmentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: i64) -> Option<QueueEntry> {
        self.state.lock().ok()?.entries.get(&id).cloned()
    }

    pub fn find_by_name(&self, normalized_name: &str) -> Vec<QueueEntry> {
        self.state
            .lock()
            .map(|s| {
                s.entries
                    .values()
                    .filter(|e| e.normalized_name == normalized_name)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<QueueEntry> {
        self.state
            .lock()
            .map(|s| s.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Make every pending entry due now, skipping backoff.
    pub fn make_all_due(&self) {
        if let Ok(mut state) = self.state.lock() {
            let now = Utc::now();
            for entry in state.entries.values_mut() {
                if entry.status == QueueStatus::Pending {
                    entry.next_attempt_at = now;
                }
            }
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Backend("queue mutex poisoned".to_string()))
    }
}

fn is_open(status: QueueStatus) -> bool {
    matches!(
        status,
        QueueStatus::Pending | QueueStatus::Processing | QueueStatus::Failed
    )
}

fn processing_entry(state: &mut QueueState, id: i64) -> Result<&mut QueueEntry, QueueError> {
    match state.entries.get_mut(&id) {
        Some(entry) if entry.status == QueueStatus::Processing => Ok(entry),
        _ => Err(QueueError::InvalidTransition {
            id,
            expected: QueueStatus::Processing.as_str(),
        }),
    }
}

#[async_trait]
impl EnrichmentQueue for InMemoryEnrichmentQueue {
    async fn enqueue_batch(&self, entries: &[NewQueueEntry]) -> Result<usize, QueueError> {
        let mut state = self.state()?;
        let now = Utc::now();
        let mut created = 0;

        for new in entries {
            if new.normalized_name.is_empty() {
                continue;
            }
            let exists = state
                .entries
                .values()
                .any(|e| e.normalized_name == new.normalized_name && is_open(e.status));
            if exists {
                continue;
            }

            state.next_id += 1;
            let id = state.next_id;
            state.entries.insert(
                id,
                QueueEntry {
                    id,
                    raw_name: new.raw_name.clone(),
                    normalized_name: new.normalized_name.clone(),
                    lookup_type: new.lookup_type,
                    temp_id: new.temp_id.clone(),
                    status: QueueStatus::Pending,
                    attempts: 0,
                    last_error: None,
                    resolved_company_id: None,
                    next_attempt_at: now,
                    created_at: now,
                    updated_at: now,
                },
            );
            created += 1;
        }
        Ok(created)
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
        let mut state = self.state()?;
        let now = Utc::now();

        let mut due: Vec<(chrono::DateTime<Utc>, i64)> = state
            .entries
            .values()
            .filter(|e| e.status == QueueStatus::Pending && e.next_attempt_at <= now)
            .map(|e| (e.created_at, e.id))
            .collect();
        due.sort();

        let mut claimed = Vec::new();
        for (_, id) in due.into_iter().take(limit) {
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.status = QueueStatus::Processing;
                entry.updated_at = now;
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_done(&self, id: i64, resolved_company_id: Option<&str>) -> Result<(), QueueError> {
        let mut state = self.state()?;
        let entry = processing_entry(&mut state, id)?;
        entry.status = QueueStatus::Done;
        entry.resolved_company_id = resolved_company_id.map(|s| s.to_string());
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn record_failure(
        &self,
        id: i64,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<QueueStatus, QueueError> {
        let mut state = self.state()?;
        let entry = processing_entry(&mut state, id)?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.status = status_after_failure(entry.attempts, disposition);
        if let FailureDisposition::Retry { retry_at, .. } = disposition {
            entry.next_attempt_at = retry_at;
        }
        entry.updated_at = Utc::now();
        Ok(entry.status)
    }

    async fn release(&self, id: i64) -> Result<(), QueueError> {
        let mut state = self.state()?;
        let entry = processing_entry(&mut state, id)?;
        entry.status = QueueStatus::Pending;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_stale(&self, older_than: Duration) -> Result<u64, QueueError> {
        let mut state = self.state()?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| QueueError::Backend(e.to_string()))?;
        let mut reset = 0;
        for entry in state.entries.values_mut() {
            if entry.status == QueueStatus::Processing && entry.updated_at < cutoff {
                entry.status = QueueStatus::Pending;
                entry.updated_at = Utc::now();
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn requeue_failed(&self) -> Result<u64, QueueError> {
        let mut state = self.state()?;
        let now = Utc::now();
        let mut requeued = 0;
        for entry in state.entries.values_mut() {
            if entry.status == QueueStatus::Failed {
                entry.status = QueueStatus::Pending;
                entry.attempts = 0;
                entry.next_attempt_at = now;
                entry.updated_at = now;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
        let state = self.state()?;
        Ok(state
            .entries
            .values()
            .filter(|e| e.status == QueueStatus::Failed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state()?;
        let mut stats = QueueStats::default();
        for entry in state.entries.values() {
            match entry.status {
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::Processing => stats.processing += 1,
                QueueStatus::Done => stats.done += 1,
                QueueStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
