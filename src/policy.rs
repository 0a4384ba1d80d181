//! Conflict policy for competing cache mappings.
//!
//! Two mappings for the same `(lookup_type, lookup_key)` are compared as a
//! tagged tuple, never merged:
//! 1. higher confidence
//! 2. higher source trust rank
//! 3. more recently updated
//! 4. lexicographically smaller `company_id`
//!
//! The last step only exists so the outcome is independent of argument order.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{CacheEntry, CacheSource};

/// Confidence differences below this are ties.
const CONFIDENCE_EPSILON: f64 = 1e-9;

/// Numeric trust rank per cache source. Higher wins ties on confidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceTrustPolicy {
    ranks: HashMap<CacheSource, u8>,
}

impl Default for SourceTrustPolicy {
    fn default() -> Self {
        let ranks = HashMap::from([
            (CacheSource::ConfigOverride, 100),
            (CacheSource::Manual, 90),
            (CacheSource::ExternalApi, 80),
            (CacheSource::Backflow, 60),
            (CacheSource::DomainLearning, 50),
            (CacheSource::Migrated, 40),
        ]);
        Self { ranks }
    }
}

impl SourceTrustPolicy {
    /// Sources missing from the table rank 0.
    pub fn rank(&self, source: CacheSource) -> u8 {
        self.ranks.get(&source).copied().unwrap_or(0)
    }

    /// Overlay configured ranks on top of the defaults.
    pub fn with_overrides(mut self, overrides: &HashMap<CacheSource, u8>) -> Self {
        for (source, rank) in overrides {
            self.ranks.insert(*source, *rank);
        }
        self
    }
}

/// What to do with a candidate given the stored entry for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Same company, nothing new.
    Unchanged,
    /// Same company, candidate carries stronger evidence.
    Reinforce,
    /// Different company, stored entry wins.
    KeepExisting,
    /// Different company, candidate wins.
    ReplaceWithCandidate,
}

#[derive(Debug, Clone, Default)]
pub struct ConflictPolicy {
    trust: SourceTrustPolicy,
}

impl ConflictPolicy {
    pub fn new(trust: SourceTrustPolicy) -> Self {
        Self { trust }
    }

    pub fn trust(&self) -> &SourceTrustPolicy {
        &self.trust
    }

    pub fn decide(&self, existing: &CacheEntry, candidate: &CacheEntry) -> ConflictDecision {
        if existing.company_id == candidate.company_id {
            let stronger = candidate.confidence > existing.confidence + CONFIDENCE_EPSILON
                || (approx_eq(candidate.confidence, existing.confidence)
                    && self.trust.rank(candidate.source) > self.trust.rank(existing.source));
            return if stronger {
                ConflictDecision::Reinforce
            } else {
                ConflictDecision::Unchanged
            };
        }

        match self.compare(candidate, existing) {
            Ordering::Greater => ConflictDecision::ReplaceWithCandidate,
            _ => ConflictDecision::KeepExisting,
        }
    }

    /// Total order on competing entries. `Greater` means `a` wins.
    pub fn compare(&self, a: &CacheEntry, b: &CacheEntry) -> Ordering {
        if !approx_eq(a.confidence, b.confidence) {
            return a
                .confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(Ordering::Equal);
        }

        let by_rank = self.trust.rank(a.source).cmp(&self.trust.rank(b.source));
        if by_rank != Ordering::Equal {
            return by_rank;
        }

        let by_recency = a.updated_at.cmp(&b.updated_at);
        if by_recency != Ordering::Equal {
            return by_recency;
        }

        // Smaller id wins, so reverse.
        b.company_id.cmp(&a.company_id)
    }

    /// The winner of two competing entries and the loser.
    pub fn pick<'a>(&self, a: &'a CacheEntry, b: &'a CacheEntry) -> (&'a CacheEntry, &'a CacheEntry) {
        match self.compare(a, b) {
            Ordering::Less => (b, a),
            _ => (a, b),
        }
    }
}

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= CONFIDENCE_EPSILON
}
