//! Company identity resolver
//!
//! Resolves a batch of records through an ordered cascade:
//!
//! 1. Operator override table
//! 2. Structured-identifier cache (plan code, account number)
//! 3. Identifier already on the record
//! 4. Name cache (account name, customer name, former name)
//! 5. Synchronous external search, gated by a per-run budget
//!
//! Records that miss every step get a deterministic temp identity and their
//! name is queued for asynchronous enrichment. Cache reads happen in a
//! single prefetch for the whole batch; hit statistics are written in the
//! background. Only a failed prefetch fails the batch.

pub mod budget;
pub mod report;
pub mod strategy;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

use crate::backflow::{BackflowCandidate, BackflowWriter};
use crate::cache::CacheStore;
use crate::config::EnrichmentConfig;
use crate::error::ResolverError;
use crate::external::ExternalLookup;
use crate::queue::EnrichmentQueue;
use crate::temp_id::{business_key, TempIdGenerator, TempIdKeyStrategy};
use crate::types::{
    CacheEntry, CacheKey, CacheSource, InputRecord, LookupType, NewQueueEntry, ResolutionResult,
    ResolutionSource,
};

pub use budget::SyncBudget;
pub use report::BatchReport;
pub use strategy::{
    CacheTierStrategy, ExistingColumnStrategy, ExternalSyncStrategy, OverrideStrategy,
    PreparedRecord, ResolutionStrategy, ResolveContext, StrategyHit,
};

/// Resolution of one input record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordOutcome {
    pub record_id: String,
    /// `None` when the record carries nothing to resolve or key on.
    pub resolution: Option<ResolutionResult>,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// One outcome per input record, in input order.
    pub outcomes: Vec<RecordOutcome>,
    pub report: BatchReport,
}

pub struct CompanyResolver {
    enabled: bool,
    sync_budget: u32,
    backflow_confidence: f64,
    temp_id_key: TempIdKeyStrategy,
    temp_ids: TempIdGenerator,
    strategies: Vec<Box<dyn ResolutionStrategy>>,
    cache: Arc<dyn CacheStore>,
    queue: Arc<dyn EnrichmentQueue>,
    writer: Arc<BackflowWriter>,
}

impl CompanyResolver {
    /// Build the resolver and its cascade from configuration.
    ///
    /// Without an external client the synchronous external step is left out.
    pub fn new(
        config: &EnrichmentConfig,
        cache: Arc<dyn CacheStore>,
        queue: Arc<dyn EnrichmentQueue>,
        external: Option<Arc<dyn ExternalLookup>>,
    ) -> Result<Self, ResolverError> {
        config.validate()?;
        let temp_ids = TempIdGenerator::new(&config.salt, config.temp_id_prefix.clone())?;
        let writer = Arc::new(BackflowWriter::from_config(cache.clone(), config));

        let mut strategies: Vec<Box<dyn ResolutionStrategy>> = vec![
            Box::new(OverrideStrategy::new(config.overrides.clone())),
            Box::new(CacheTierStrategy::structured()),
            Box::new(ExistingColumnStrategy::new(
                config.existing_column_confidence,
                config.temp_id_prefix.clone(),
            )),
            Box::new(CacheTierStrategy::names()),
        ];
        if let Some(client) = external {
            strategies.push(Box::new(ExternalSyncStrategy::new(
                client,
                config.min_match_score,
            )));
        }

        Ok(Self {
            enabled: config.enabled,
            sync_budget: config.sync_budget,
            backflow_confidence: config.backflow_confidence,
            temp_id_key: config.temp_id_key,
            temp_ids,
            strategies,
            cache,
            queue,
            writer,
        })
    }

    /// The writer this resolver backflows through, shared with the queue
    /// consumer and domain learning so every cache write takes one path.
    pub fn writer(&self) -> Arc<BackflowWriter> {
        self.writer.clone()
    }

    pub fn temp_ids(&self) -> &TempIdGenerator {
        &self.temp_ids
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Resolve a batch of records.
    ///
    /// Per-record failures (external errors, backflow or enqueue errors)
    /// degrade that record; the only batch-level failure is a cache store
    /// that cannot be read.
    pub async fn resolve_batch(&self, records: &[InputRecord]) -> Result<BatchOutcome, ResolverError> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let mut report = BatchReport::new(run_id, records.len());
        let prepared: Vec<PreparedRecord<'_>> = records.iter().map(PreparedRecord::new).collect();

        tracing::info!(
            run_id = %run_id,
            records = records.len(),
            enabled = self.enabled,
            budget = self.sync_budget,
            "Resolving company identities"
        );

        if !self.enabled {
            let outcomes = prepared
                .iter()
                .map(|p| self.assign_temp(p, &mut report))
                .collect();
            report.duration_ms = started.elapsed().as_millis() as u64;
            report.log();
            return Ok(BatchOutcome { outcomes, report });
        }

        let cache_hits = self.prefetch(&prepared, run_id).await?;
        let budget = SyncBudget::new(self.sync_budget);
        let mut ctx = ResolveContext::new(&cache_hits, &budget);

        let mut outcomes = Vec::with_capacity(records.len());
        let mut backflow: Vec<BackflowCandidate> = Vec::new();
        let mut to_enqueue: Vec<NewQueueEntry> = Vec::new();
        let mut enqueued_names: HashSet<String> = HashSet::new();

        for record in &prepared {
            let mut hit = None;
            for strategy in &self.strategies {
                if let Some(found) = strategy.try_resolve(record, &mut ctx).await {
                    tracing::debug!(
                        record_id = %record.record.record_id,
                        step = strategy.name(),
                        company_id = %found.result.company_id,
                        "Record resolved"
                    );
                    hit = Some(found);
                    break;
                }
            }

            match hit {
                Some(hit) => {
                    report.count(hit.result.source);
                    backflow.extend(self.backflow_candidates(record, &hit));
                    outcomes.push(RecordOutcome {
                        record_id: record.record.record_id.clone(),
                        resolution: Some(hit.result),
                    });
                }
                None => {
                    let outcome = self.assign_temp(record, &mut report);
                    if outcome.resolution.is_some() {
                        if let (Some(lookup_type), Some(raw), Some(key)) = (
                            record.name_type,
                            record.record.primary_name(),
                            record.name_key(),
                        ) {
                            if enqueued_names.insert(key.to_string()) {
                                to_enqueue.push(NewQueueEntry {
                                    raw_name: raw.trim().to_string(),
                                    normalized_name: key.to_string(),
                                    lookup_type,
                                    temp_id: outcome
                                        .resolution
                                        .as_ref()
                                        .map(|r| r.company_id.clone()),
                                });
                            }
                        }
                    }
                    outcomes.push(outcome);
                }
            }
        }

        report.external_calls = ctx.external_calls;
        report.external_failures = ctx.external_failures;
        report.budget_remaining = budget.remaining();

        self.spawn_hit_stats(std::mem::take(&mut ctx.hit_keys));

        if !backflow.is_empty() {
            match self.writer.record_batch(&backflow).await {
                Ok(written) => report.backflow = written,
                Err(e) => tracing::warn!(
                    run_id = %run_id,
                    candidates = backflow.len(),
                    error = %e,
                    "Backflow failed, mappings will be learned on a later run"
                ),
            }
        }

        if !to_enqueue.is_empty() {
            match self.queue.enqueue_batch(&to_enqueue).await {
                Ok(created) => report.enqueued = created,
                Err(e) => tracing::warn!(
                    run_id = %run_id,
                    names = to_enqueue.len(),
                    error = %e,
                    "Failed to enqueue unresolved names"
                ),
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        report.log();
        Ok(BatchOutcome { outcomes, report })
    }

    /// One round trip for every key of every record.
    async fn prefetch(
        &self,
        prepared: &[PreparedRecord<'_>],
        run_id: Uuid,
    ) -> Result<HashMap<CacheKey, CacheEntry>, ResolverError> {
        let mut keys: Vec<CacheKey> = prepared.iter().flat_map(|p| p.cache_keys()).collect();
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        match self.cache.lookup_batch(&keys).await {
            Ok(hits) => {
                tracing::debug!(run_id = %run_id, keys = keys.len(), hits = hits.len(), "Cache prefetch");
                Ok(hits)
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Cache store unreadable, aborting batch");
                Err(e.into())
            }
        }
    }

    /// Statistics only; never on the read path. Skipped when the caller is
    /// not running inside a Tokio runtime.
    fn spawn_hit_stats(&self, mut keys: Vec<CacheKey>) {
        if keys.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(keys = keys.len(), "No Tokio runtime, cache hit statistics not recorded");
            return;
        };
        keys.sort();
        keys.dedup();
        let cache = self.cache.clone();
        runtime.spawn(async move {
            if let Err(e) = cache.record_hits(&keys).await {
                tracing::warn!(keys = keys.len(), error = %e, "Failed to record cache hit statistics");
            }
        });
    }

    fn assign_temp(&self, record: &PreparedRecord<'_>, report: &mut BatchReport) -> RecordOutcome {
        let record_id = record.record.record_id.clone();
        let key = business_key(
            record.name_key(),
            record.record.secondary_code(),
            self.temp_id_key,
        );

        let Some(key) = key else {
            report.unresolvable += 1;
            tracing::debug!(record_id = %record_id, "Record has nothing to resolve");
            return RecordOutcome {
                record_id,
                resolution: None,
            };
        };

        match self.temp_ids.generate(&key) {
            Ok(company_id) => {
                report.count(ResolutionSource::Temp);
                RecordOutcome {
                    record_id,
                    resolution: Some(ResolutionResult {
                        company_id,
                        source: ResolutionSource::Temp,
                        confidence: 0.0,
                        matched_type: None,
                    }),
                }
            }
            Err(e) => {
                report.unresolvable += 1;
                tracing::warn!(record_id = %record_id, error = %e, "Temp identity not generated");
                RecordOutcome {
                    record_id,
                    resolution: None,
                }
            }
        }
    }

    /// Mappings learned from a resolved record: every signal it carries,
    /// plus the names the service reported for external hits.
    fn backflow_candidates(&self, record: &PreparedRecord<'_>, hit: &StrategyHit) -> Vec<BackflowCandidate> {
        let (source, confidence) = match hit.result.source {
            ResolutionSource::ExternalSync => (CacheSource::ExternalApi, hit.result.confidence),
            // A cache hit never vouches for more than its own confidence.
            ResolutionSource::Cache => (
                CacheSource::Backflow,
                self.backflow_confidence.min(hit.result.confidence),
            ),
            ResolutionSource::Temp => return Vec::new(),
            ResolutionSource::Override | ResolutionSource::ExistingColumn => {
                (CacheSource::Backflow, self.backflow_confidence)
            }
        };
        let company_id = hit.result.company_id.as_str();
        let matched_cache_type = match hit.result.source {
            ResolutionSource::Cache => hit.result.matched_type,
            _ => None,
        };

        let mut candidates: Vec<BackflowCandidate> = record
            .record
            .signals()
            .into_iter()
            .filter(|(t, _)| *t != LookupType::FormerName && Some(*t) != matched_cache_type)
            .map(|(t, raw)| BackflowCandidate::new(t, raw, company_id, source, confidence))
            .collect();

        if let Some(official) = &hit.official_name {
            candidates.push(BackflowCandidate::new(
                LookupType::CustomerName,
                official.as_str(),
                company_id,
                source,
                confidence,
            ));
        }
        candidates.extend(hit.aliases.iter().map(|alias| {
            BackflowCandidate::new(LookupType::FormerName, alias.as_str(), company_id, source, confidence)
        }));
        candidates
    }
}
