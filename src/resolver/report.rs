//! Per-run summary of a resolver batch.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::backflow::BackflowReport;
use crate::types::ResolutionSource;

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub total: usize,
    /// Resolutions per cascade step, keyed by `ResolutionSource::as_str`.
    pub by_source: BTreeMap<&'static str, usize>,
    pub temp_assigned: usize,
    /// New queue entries created by this run.
    pub enqueued: usize,
    pub external_calls: usize,
    pub external_failures: usize,
    pub budget_remaining: u32,
    /// Records with no usable signal at all.
    pub unresolvable: usize,
    pub backflow: BackflowReport,
    pub duration_ms: u64,
}

impl BatchReport {
    pub fn new(run_id: Uuid, total: usize) -> Self {
        Self {
            run_id,
            total,
            by_source: BTreeMap::new(),
            temp_assigned: 0,
            enqueued: 0,
            external_calls: 0,
            external_failures: 0,
            budget_remaining: 0,
            unresolvable: 0,
            backflow: BackflowReport::default(),
            duration_ms: 0,
        }
    }

    pub fn count(&mut self, source: ResolutionSource) {
        *self.by_source.entry(source.as_str()).or_insert(0) += 1;
        if source == ResolutionSource::Temp {
            self.temp_assigned += 1;
        }
    }

    pub fn resolved_by(&self, source: ResolutionSource) -> usize {
        self.by_source.get(source.as_str()).copied().unwrap_or(0)
    }

    /// Records that ended up with a real (non-provisional) identity.
    pub fn resolved(&self) -> usize {
        self.by_source
            .iter()
            .filter(|(k, _)| **k != ResolutionSource::Temp.as_str())
            .map(|(_, v)| v)
            .sum()
    }

    pub fn log(&self) {
        tracing::info!(
            run_id = %self.run_id,
            total = self.total,
            resolved = self.resolved(),
            override_hits = self.resolved_by(ResolutionSource::Override),
            cache_hits = self.resolved_by(ResolutionSource::Cache),
            existing = self.resolved_by(ResolutionSource::ExistingColumn),
            external = self.resolved_by(ResolutionSource::ExternalSync),
            temp_assigned = self.temp_assigned,
            enqueued = self.enqueued,
            external_calls = self.external_calls,
            external_failures = self.external_failures,
            budget_remaining = self.budget_remaining,
            unresolvable = self.unresolvable,
            backflow_written = self.backflow.written(),
            conflicts = self.backflow.conflicts_logged,
            duration_ms = self.duration_ms,
            "Company resolution batch complete"
        );
    }
}
