//! Cascade steps
//!
//! Each step is a [`ResolutionStrategy`]; the resolver walks them in order
//! and stops at the first hit. Temp identity assignment is not a strategy:
//! it is the fallback when every step misses.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::budget::SyncBudget;
use crate::config::OverrideTable;
use crate::external::{best_match, ExternalLookup};
use crate::normalize::{normalize_detailed, NormalizedName};
use crate::temp_id::is_temp_id_with_prefix;
use crate::types::{
    CacheEntry, CacheKey, InputRecord, LookupType, ResolutionResult, ResolutionSource,
};

// ─── Prepared record ─────────────────────────────────────────────────────────

/// An input record with every signal normalized once.
#[derive(Debug, Clone)]
pub struct PreparedRecord<'a> {
    pub record: &'a InputRecord,
    /// `(lookup_type, normalized)` in cascade priority order.
    pub signals: Vec<(LookupType, NormalizedName)>,
    /// Normalized primary name, used for external search and queueing.
    pub name: Option<NormalizedName>,
    /// Field the primary name came from.
    pub name_type: Option<LookupType>,
}

impl<'a> PreparedRecord<'a> {
    pub fn new(record: &'a InputRecord) -> Self {
        let signals = record
            .signals()
            .into_iter()
            .map(|(lookup_type, raw)| (lookup_type, normalize_detailed(raw)))
            .collect();
        let (name_type, name) = match record.primary_name_signal() {
            Some((lookup_type, raw)) => (Some(lookup_type), Some(normalize_detailed(raw))),
            None => (None, None),
        };
        Self {
            record,
            signals,
            name,
            name_type,
        }
    }

    /// Non-empty read keys. Bracket-repaired keys are still usable for reads.
    pub fn cache_keys(&self) -> impl Iterator<Item = CacheKey> + '_ {
        self.signals
            .iter()
            .filter(|(_, n)| !n.is_empty)
            .map(|(t, n)| CacheKey::new(*t, n.key.clone()))
    }

    pub fn key_for(&self, lookup_type: LookupType) -> Option<&str> {
        self.signals
            .iter()
            .find(|(t, n)| *t == lookup_type && !n.is_empty)
            .map(|(_, n)| n.key.as_str())
    }

    pub fn name_key(&self) -> Option<&str> {
        self.name.as_ref().map(|n| n.key.as_str())
    }

    /// Whether any step could possibly match this record.
    pub fn has_signal(&self) -> bool {
        self.signals.iter().any(|(_, n)| !n.is_empty)
            || self
                .record
                .company_id
                .as_deref()
                .is_some_and(|id| !id.trim().is_empty())
    }
}

// ─── Context ─────────────────────────────────────────────────────────────────

/// Per-run state shared by the steps.
pub struct ResolveContext<'a> {
    /// Result of the single batch prefetch.
    pub cache_hits: &'a HashMap<CacheKey, CacheEntry>,
    pub budget: &'a SyncBudget,
    /// Keys whose hit statistics should be bumped.
    pub hit_keys: Vec<CacheKey>,
    pub external_calls: usize,
    pub external_failures: usize,
}

impl<'a> ResolveContext<'a> {
    pub fn new(cache_hits: &'a HashMap<CacheKey, CacheEntry>, budget: &'a SyncBudget) -> Self {
        Self {
            cache_hits,
            budget,
            hit_keys: Vec::new(),
            external_calls: 0,
            external_failures: 0,
        }
    }
}

/// A successful step.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyHit {
    pub result: ResolutionResult,
    /// Extra names the matched company is known by (external hits).
    pub aliases: Vec<String>,
    /// Canonical name reported by the service (external hits).
    pub official_name: Option<String>,
}

impl StrategyHit {
    fn new(result: ResolutionResult) -> Self {
        Self {
            result,
            aliases: Vec::new(),
            official_name: None,
        }
    }
}

#[async_trait]
pub trait ResolutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` means "not resolved here, try the next step".
    async fn try_resolve(
        &self,
        record: &PreparedRecord<'_>,
        ctx: &mut ResolveContext<'_>,
    ) -> Option<StrategyHit>;
}

// ─── Override ────────────────────────────────────────────────────────────────

/// Operator-maintained mappings, highest priority.
pub struct OverrideStrategy {
    overrides: OverrideTable,
}

impl OverrideStrategy {
    pub fn new(overrides: OverrideTable) -> Self {
        Self { overrides }
    }
}

#[async_trait]
impl ResolutionStrategy for OverrideStrategy {
    fn name(&self) -> &'static str {
        "override"
    }

    async fn try_resolve(
        &self,
        record: &PreparedRecord<'_>,
        _ctx: &mut ResolveContext<'_>,
    ) -> Option<StrategyHit> {
        if self.overrides.is_empty() {
            return None;
        }
        record
            .signals
            .iter()
            .filter(|(_, n)| !n.is_empty)
            .find_map(|(lookup_type, n)| {
                self.overrides.get(*lookup_type, &n.key).map(|company_id| {
                    StrategyHit::new(ResolutionResult {
                        company_id: company_id.to_string(),
                        source: ResolutionSource::Override,
                        confidence: 1.0,
                        matched_type: Some(*lookup_type),
                    })
                })
            })
    }
}

// ─── Cache tiers ─────────────────────────────────────────────────────────────

pub const STRUCTURED_TIER: &[LookupType] = &[LookupType::PlanCode, LookupType::AccountNumber];
pub const NAME_TIER: &[LookupType] = &[
    LookupType::AccountName,
    LookupType::CustomerName,
    LookupType::FormerName,
];

/// Cache lookup over one priority tier of lookup types.
///
/// Every type in the tier is checked; the strongest hit wins, ties going to
/// the more specific type.
pub struct CacheTierStrategy {
    name: &'static str,
    tier: &'static [LookupType],
}

impl CacheTierStrategy {
    pub fn structured() -> Self {
        Self {
            name: "structured_cache",
            tier: STRUCTURED_TIER,
        }
    }

    pub fn names() -> Self {
        Self {
            name: "name_cache",
            tier: NAME_TIER,
        }
    }
}

#[async_trait]
impl ResolutionStrategy for CacheTierStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn try_resolve(
        &self,
        record: &PreparedRecord<'_>,
        ctx: &mut ResolveContext<'_>,
    ) -> Option<StrategyHit> {
        let mut best: Option<(CacheKey, &CacheEntry)> = None;
        for lookup_type in self.tier {
            let Some(key) = record.key_for(*lookup_type) else {
                continue;
            };
            let cache_key = CacheKey::new(*lookup_type, key);
            let Some(entry) = ctx.cache_hits.get(&cache_key) else {
                continue;
            };
            let stronger = match &best {
                None => true,
                Some((_, current)) => entry.confidence > current.confidence,
            };
            if stronger {
                best = Some((cache_key, entry));
            }
        }

        let (key, entry) = best?;
        let hit = StrategyHit::new(ResolutionResult {
            company_id: entry.company_id.clone(),
            source: ResolutionSource::Cache,
            confidence: entry.confidence,
            matched_type: Some(key.lookup_type),
        });
        ctx.hit_keys.push(key);
        Some(hit)
    }
}

// ─── Existing column ─────────────────────────────────────────────────────────

/// Pass through an identifier already present on the record. Provisional
/// identifiers are not passed through; they get another chance at a real
/// resolution.
pub struct ExistingColumnStrategy {
    confidence: f64,
    temp_id_prefix: String,
}

impl ExistingColumnStrategy {
    pub fn new(confidence: f64, temp_id_prefix: impl Into<String>) -> Self {
        Self {
            confidence,
            temp_id_prefix: temp_id_prefix.into(),
        }
    }
}

#[async_trait]
impl ResolutionStrategy for ExistingColumnStrategy {
    fn name(&self) -> &'static str {
        "existing_column"
    }

    async fn try_resolve(
        &self,
        record: &PreparedRecord<'_>,
        _ctx: &mut ResolveContext<'_>,
    ) -> Option<StrategyHit> {
        let company_id = record.record.company_id.as_deref()?.trim();
        if company_id.is_empty() || is_temp_id_with_prefix(company_id, &self.temp_id_prefix) {
            return None;
        }
        Some(StrategyHit::new(ResolutionResult {
            company_id: company_id.to_string(),
            source: ResolutionSource::ExistingColumn,
            confidence: self.confidence,
            matched_type: None,
        }))
    }
}

// ─── External sync ───────────────────────────────────────────────────────────

/// Budget-gated synchronous search by name.
pub struct ExternalSyncStrategy {
    client: Arc<dyn ExternalLookup>,
    min_match_score: f64,
}

impl ExternalSyncStrategy {
    pub fn new(client: Arc<dyn ExternalLookup>, min_match_score: f64) -> Self {
        Self {
            client,
            min_match_score,
        }
    }
}

#[async_trait]
impl ResolutionStrategy for ExternalSyncStrategy {
    fn name(&self) -> &'static str {
        "external_sync"
    }

    async fn try_resolve(
        &self,
        record: &PreparedRecord<'_>,
        ctx: &mut ResolveContext<'_>,
    ) -> Option<StrategyHit> {
        let raw_name = record.record.primary_name()?;
        record.name_key()?;

        if !ctx.budget.try_consume() {
            return None;
        }
        ctx.external_calls += 1;

        match self.client.search_by_name(raw_name).await {
            Ok(candidates) => {
                let Some(top) = best_match(&candidates, self.min_match_score) else {
                    tracing::debug!(
                        record_id = %record.record.record_id,
                        candidates = candidates.len(),
                        "No external candidate above threshold"
                    );
                    return None;
                };
                Some(StrategyHit {
                    result: ResolutionResult {
                        company_id: top.company_id.clone(),
                        source: ResolutionSource::ExternalSync,
                        confidence: top.score,
                        matched_type: None,
                    },
                    aliases: top.aliases.clone(),
                    official_name: Some(top.official_name.clone()),
                })
            }
            Err(e) => {
                ctx.external_failures += 1;
                tracing::warn!(
                    record_id = %record.record.record_id,
                    error = %e,
                    "External lookup failed, record degrades to temp identity"
                );
                None
            }
        }
    }
}
