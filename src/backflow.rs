//! Backflow writer
//!
//! The only component that writes mappings into the cache. Every caller
//! (resolver, queue consumer, domain learning) hands over raw keys; the
//! writer re-normalizes them, reduces duplicates within the batch, inserts
//! new keys and settles disagreements with [`ConflictPolicy`]. Losing
//! candidates are appended to the conflict audit trail.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::cache::CacheStore;
use crate::config::{DomainLearningConfig, EnrichmentConfig};
use crate::error::CacheStoreError;
use crate::normalize::normalize_detailed;
use crate::policy::{ConflictDecision, ConflictPolicy};
use crate::temp_id::is_temp_id_with_prefix;
use crate::types::{CacheEntry, CacheKey, CacheSource, ConflictRecord, InputRecord, LookupType};

/// Attempts at a compare-and-swap before giving up on a contended key.
const MAX_REPLACE_ATTEMPTS: usize = 3;

/// A mapping offered to the cache. The key is raw and gets normalized here.
#[derive(Debug, Clone)]
pub struct BackflowCandidate {
    pub lookup_type: LookupType,
    pub raw_key: String,
    pub company_id: String,
    pub source: CacheSource,
    pub confidence: f64,
    pub source_domain: Option<String>,
}

impl BackflowCandidate {
    pub fn new(
        lookup_type: LookupType,
        raw_key: impl Into<String>,
        company_id: impl Into<String>,
        source: CacheSource,
        confidence: f64,
    ) -> Self {
        Self {
            lookup_type,
            raw_key: raw_key.into(),
            company_id: company_id.into(),
            source,
            confidence,
            source_domain: None,
        }
    }

    pub fn with_source_domain(mut self, domain: impl Into<String>) -> Self {
        self.source_domain = Some(domain.into());
        self
    }
}

/// What a backflow call did to the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackflowReport {
    pub inserted: usize,
    /// Same company already stored with equal or stronger evidence.
    pub skipped: usize,
    /// Same company, confidence or source upgraded.
    pub reinforced: usize,
    /// Different company, candidate won.
    pub replaced: usize,
    /// Different company, stored entry won.
    pub kept_existing: usize,
    pub conflicts_logged: usize,
    /// Unusable key, repaired key, temp or empty company id.
    pub rejected: usize,
    /// Compare-and-swap kept losing to concurrent writers.
    pub lost_races: usize,
}

impl BackflowReport {
    pub fn merge(&mut self, other: &BackflowReport) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
        self.reinforced += other.reinforced;
        self.replaced += other.replaced;
        self.kept_existing += other.kept_existing;
        self.conflicts_logged += other.conflicts_logged;
        self.rejected += other.rejected;
        self.lost_races += other.lost_races;
    }

    pub fn written(&self) -> usize {
        self.inserted + self.reinforced + self.replaced
    }
}

pub struct BackflowWriter {
    cache: Arc<dyn CacheStore>,
    policy: ConflictPolicy,
    temp_id_prefix: String,
    learning: DomainLearningConfig,
}

impl BackflowWriter {
    pub fn new(cache: Arc<dyn CacheStore>, policy: ConflictPolicy, temp_id_prefix: impl Into<String>) -> Self {
        Self {
            cache,
            policy,
            temp_id_prefix: temp_id_prefix.into(),
            learning: DomainLearningConfig::default(),
        }
    }

    pub fn from_config(cache: Arc<dyn CacheStore>, config: &EnrichmentConfig) -> Self {
        Self::new(
            cache,
            ConflictPolicy::new(config.trust_policy()),
            config.temp_id_prefix.clone(),
        )
        .with_domain_learning(config.domain_learning.clone())
    }

    pub fn with_domain_learning(mut self, learning: DomainLearningConfig) -> Self {
        self.learning = learning;
        self
    }

    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    /// Record a single confirmed mapping.
    pub async fn record(
        &self,
        lookup_type: LookupType,
        key: &str,
        company_id: &str,
        source: CacheSource,
        confidence: f64,
    ) -> Result<BackflowReport, CacheStoreError> {
        self.record_batch(&[BackflowCandidate::new(
            lookup_type,
            key,
            company_id,
            source,
            confidence,
        )])
        .await
    }

    /// Record a batch of confirmed mappings.
    pub async fn record_batch(
        &self,
        candidates: &[BackflowCandidate],
    ) -> Result<BackflowReport, CacheStoreError> {
        let mut report = BackflowReport::default();
        let mut audit: Vec<ConflictRecord> = Vec::new();

        let reduced = self.reduce(candidates, &mut report, &mut audit);
        if reduced.is_empty() {
            self.flush_audit(&audit, &mut report).await;
            return Ok(report);
        }

        let keys: Vec<CacheKey> = reduced.iter().map(CacheEntry::key).collect();
        let existing = self.cache.lookup_batch(&keys).await?;

        let (fresh, contested): (Vec<CacheEntry>, Vec<CacheEntry>) = reduced
            .into_iter()
            .partition(|entry| !existing.contains_key(&entry.key()));

        if !fresh.is_empty() {
            let result = self.cache.insert_batch(&fresh).await?;
            report.inserted += result.inserted;
            report.skipped += result.skipped;
            // Another writer got there between our read and insert.
            for conflict in result.conflicts {
                self.settle(conflict.existing, conflict.candidate, &mut report, &mut audit)
                    .await?;
            }
        }

        for candidate in contested {
            if let Some(stored) = existing.get(&candidate.key()) {
                self.settle(stored.clone(), candidate, &mut report, &mut audit)
                    .await?;
            }
        }

        self.flush_audit(&audit, &mut report).await;

        tracing::debug!(
            inserted = report.inserted,
            reinforced = report.reinforced,
            replaced = report.replaced,
            kept_existing = report.kept_existing,
            rejected = report.rejected,
            "Backflow batch written"
        );
        Ok(report)
    }

    /// Learn name mappings from rows that already carry a real company id.
    ///
    /// A normalized name is learned only when it appears at least
    /// `min_occurrences` times and every occurrence agrees on the company.
    pub async fn learn_from_records(
        &self,
        domain: &str,
        records: &[InputRecord],
    ) -> Result<BackflowReport, CacheStoreError> {
        let mut seen: HashMap<CacheKey, (usize, HashSet<&str>, &str)> = HashMap::new();

        for record in records {
            let Some(company_id) = record
                .company_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty() && !self.is_temp_id(id))
            else {
                continue;
            };

            let names = [
                (LookupType::AccountName, record.account_name.as_deref()),
                (LookupType::CustomerName, record.customer_name.as_deref()),
            ];
            for (lookup_type, raw) in names {
                let Some(raw) = raw else { continue };
                let normalized = normalize_detailed(raw);
                if !normalized.is_trusted_key() {
                    continue;
                }
                let slot = seen
                    .entry(CacheKey::new(lookup_type, normalized.key))
                    .or_insert_with(|| (0, HashSet::new(), raw));
                slot.0 += 1;
                slot.1.insert(company_id);
            }
        }

        let mut learnable: Vec<(CacheKey, &str, &str)> = seen
            .into_iter()
            .filter(|(_, (count, companies, _))| {
                *count >= self.learning.min_occurrences.max(1) && companies.len() == 1
            })
            .filter_map(|(key, (_, companies, raw))| {
                companies.into_iter().next().map(|company| (key, raw, company))
            })
            .collect();
        learnable.sort_by(|a, b| a.0.cmp(&b.0));

        let candidates: Vec<BackflowCandidate> = learnable
            .into_iter()
            .map(|(key, raw, company)| {
                BackflowCandidate::new(
                    key.lookup_type,
                    raw,
                    company,
                    CacheSource::DomainLearning,
                    self.learning.confidence,
                )
                .with_source_domain(domain)
            })
            .collect();

        let report = self.record_batch(&candidates).await?;
        tracing::info!(
            domain,
            rows = records.len(),
            candidates = candidates.len(),
            inserted = report.inserted,
            "Domain learning completed"
        );
        Ok(report)
    }

    fn is_temp_id(&self, company_id: &str) -> bool {
        is_temp_id_with_prefix(company_id, &self.temp_id_prefix)
    }

    /// Validate and normalize candidates, then keep one winner per key.
    fn reduce(
        &self,
        candidates: &[BackflowCandidate],
        report: &mut BackflowReport,
        audit: &mut Vec<ConflictRecord>,
    ) -> Vec<CacheEntry> {
        let mut order: Vec<CacheKey> = Vec::new();
        let mut winners: HashMap<CacheKey, CacheEntry> = HashMap::new();

        for candidate in candidates {
            let company_id = candidate.company_id.trim();
            if company_id.is_empty() || self.is_temp_id(company_id) {
                report.rejected += 1;
                continue;
            }
            let normalized = normalize_detailed(&candidate.raw_key);
            if !normalized.is_trusted_key() {
                tracing::debug!(
                    lookup_type = %candidate.lookup_type,
                    raw_key = %candidate.raw_key,
                    "Backflow rejected untrusted key"
                );
                report.rejected += 1;
                continue;
            }

            let mut entry = CacheEntry::new(
                candidate.lookup_type,
                normalized.key,
                company_id,
                candidate.source,
                candidate.confidence,
            );
            entry.source_domain = candidate.source_domain.clone();

            let key = entry.key();
            match winners.get(&key) {
                None => {
                    order.push(key.clone());
                    winners.insert(key, entry);
                }
                Some(current) => match self.policy.decide(current, &entry) {
                    ConflictDecision::Unchanged => report.skipped += 1,
                    ConflictDecision::Reinforce => {
                        report.skipped += 1;
                        winners.insert(key, entry);
                    }
                    ConflictDecision::KeepExisting => {
                        audit.push(ConflictRecord::new(current, &entry));
                    }
                    ConflictDecision::ReplaceWithCandidate => {
                        audit.push(ConflictRecord::new(&entry, current));
                        winners.insert(key, entry);
                    }
                },
            }
        }

        order
            .into_iter()
            .filter_map(|key| winners.remove(&key))
            .collect()
    }

    /// Resolve a candidate against the stored entry, retrying the
    /// compare-and-swap when a concurrent writer changes the row under us.
    async fn settle(
        &self,
        mut stored: CacheEntry,
        candidate: CacheEntry,
        report: &mut BackflowReport,
        audit: &mut Vec<ConflictRecord>,
    ) -> Result<(), CacheStoreError> {
        for _ in 0..MAX_REPLACE_ATTEMPTS {
            let replacement = match self.policy.decide(&stored, &candidate) {
                ConflictDecision::Unchanged => {
                    report.skipped += 1;
                    return Ok(());
                }
                ConflictDecision::KeepExisting => {
                    report.kept_existing += 1;
                    audit.push(ConflictRecord::new(&stored, &candidate));
                    tracing::info!(
                        lookup_type = %stored.lookup_type,
                        lookup_key = %stored.lookup_key,
                        kept = %stored.company_id,
                        rejected = %candidate.company_id,
                        "Conflicting mapping, stored entry kept"
                    );
                    return Ok(());
                }
                ConflictDecision::Reinforce => {
                    let mut upgraded = stored.clone();
                    upgraded.confidence = candidate.confidence;
                    upgraded.source = candidate.source;
                    upgraded.source_domain = candidate
                        .source_domain
                        .clone()
                        .or_else(|| stored.source_domain.clone());
                    upgraded
                }
                ConflictDecision::ReplaceWithCandidate => candidate.clone(),
            };

            if self.cache.replace_if_unchanged(&stored, &replacement).await? {
                if replacement.company_id == stored.company_id {
                    report.reinforced += 1;
                } else {
                    report.replaced += 1;
                    audit.push(ConflictRecord::new(&replacement, &stored));
                    tracing::info!(
                        lookup_type = %stored.lookup_type,
                        lookup_key = %stored.lookup_key,
                        replaced = %stored.company_id,
                        with = %replacement.company_id,
                        "Conflicting mapping, stored entry replaced"
                    );
                }
                return Ok(());
            }

            // Lost the race: re-read and decide again.
            let key = stored.key();
            let current = self.cache.lookup_batch(std::slice::from_ref(&key)).await?;
            match current.get(&key) {
                Some(latest) => stored = latest.clone(),
                None => {
                    let result = self.cache.insert_batch(std::slice::from_ref(&candidate)).await?;
                    report.inserted += result.inserted;
                    report.skipped += result.skipped;
                    match result.conflicts.into_iter().next() {
                        Some(conflict) => stored = conflict.existing,
                        None => return Ok(()),
                    }
                }
            }
        }

        report.lost_races += 1;
        tracing::warn!(
            lookup_type = %candidate.lookup_type,
            lookup_key = %candidate.lookup_key,
            company_id = %candidate.company_id,
            "Backflow gave up on contended key"
        );
        Ok(())
    }

    /// The audit trail is outside the hot path; a failed append is logged
    /// and does not undo the cache writes.
    async fn flush_audit(&self, audit: &[ConflictRecord], report: &mut BackflowReport) {
        if audit.is_empty() {
            return;
        }
        match self.cache.append_conflicts(audit).await {
            Ok(()) => report.conflicts_logged += audit.len(),
            Err(e) => tracing::warn!(
                records = audit.len(),
                error = %e,
                "Failed to append conflict audit records"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheStore;
    use crate::policy::SourceTrustPolicy;

    fn writer(store: &Arc<InMemoryCacheStore>) -> BackflowWriter {
        BackflowWriter::new(
            store.clone(),
            ConflictPolicy::new(SourceTrustPolicy::default()),
            "IN_",
        )
    }

    #[tokio::test]
    async fn test_record_normalizes_key() {
        let store = Arc::new(InMemoryCacheStore::new());
        let report = writer(&store)
            .record(LookupType::CustomerName, "  abc 公司 ", "C1", CacheSource::Backflow, 0.9)
            .await
            .unwrap();
        assert_eq!(report.inserted, 1);

        let entry = store
            .get(&CacheKey::new(LookupType::CustomerName, "ABC公司"))
            .unwrap();
        assert_eq!(entry.company_id, "C1");
    }

    #[tokio::test]
    async fn test_idempotent_write() {
        let store = Arc::new(InMemoryCacheStore::new());
        let w = writer(&store);
        w.record(LookupType::PlanCode, "P001", "C1", CacheSource::Backflow, 0.9)
            .await
            .unwrap();
        let before = store.snapshot();
        let report = w
            .record(LookupType::PlanCode, "P001", "C1", CacheSource::Backflow, 0.9)
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.written(), 0);
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_rejects_untrusted_inputs() {
        let store = Arc::new(InMemoryCacheStore::new());
        let w = writer(&store);
        let candidates = vec![
            BackflowCandidate::new(LookupType::CustomerName, "N/A", "C1", CacheSource::Backflow, 0.9),
            BackflowCandidate::new(LookupType::CustomerName, "ABC(上海", "C1", CacheSource::Backflow, 0.9),
            BackflowCandidate::new(LookupType::CustomerName, "ABC", "IN_ABCDEFGHIJKLMNOP", CacheSource::Backflow, 0.9),
            BackflowCandidate::new(LookupType::CustomerName, "ABC", "  ", CacheSource::Backflow, 0.9),
        ];
        let report = w.record_batch(&candidates).await.unwrap();
        assert_eq!(report.rejected, 4);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_conflict_higher_confidence_wins_either_order() {
        for flip in [false, true] {
            let store = Arc::new(InMemoryCacheStore::new());
            let w = writer(&store);
            let mut writes = vec![("C_LOW", 0.6), ("C_HIGH", 0.95)];
            if flip {
                writes.reverse();
            }
            for (company, confidence) in writes {
                w.record(LookupType::AccountName, "Acme", company, CacheSource::Backflow, confidence)
                    .await
                    .unwrap();
            }
            let entry = store.get(&CacheKey::new(LookupType::AccountName, "ACME")).unwrap();
            assert_eq!(entry.company_id, "C_HIGH");
            assert_eq!(entry.confidence, 0.95);

            let log = store.conflict_log();
            assert_eq!(log.len(), 1);
            assert_eq!(log[0].loser_company_id, "C_LOW");
        }
    }

    #[tokio::test]
    async fn test_tie_broken_by_trust_rank() {
        let store = Arc::new(InMemoryCacheStore::new());
        let w = writer(&store);
        w.record(LookupType::AccountName, "Acme", "C_MIG", CacheSource::Migrated, 0.9)
            .await
            .unwrap();
        let report = w
            .record(LookupType::AccountName, "Acme", "C_EXT", CacheSource::ExternalApi, 0.9)
            .await
            .unwrap();
        assert_eq!(report.replaced, 1);
        assert_eq!(
            store.get(&CacheKey::new(LookupType::AccountName, "ACME")).unwrap().company_id,
            "C_EXT"
        );
    }

    #[tokio::test]
    async fn test_reinforcement_upgrades_confidence() {
        let store = Arc::new(InMemoryCacheStore::new());
        let w = writer(&store);
        w.record(LookupType::CustomerName, "Acme", "C1", CacheSource::DomainLearning, 0.85)
            .await
            .unwrap();
        let report = w
            .record(LookupType::CustomerName, "Acme", "C1", CacheSource::ExternalApi, 0.97)
            .await
            .unwrap();
        assert_eq!(report.reinforced, 1);
        let entry = store.get(&CacheKey::new(LookupType::CustomerName, "ACME")).unwrap();
        assert_eq!(entry.confidence, 0.97);
        assert_eq!(entry.source, CacheSource::ExternalApi);
        assert!(store.conflict_log().is_empty());

        // weaker evidence for the same company is a no-op
        let report = w
            .record(LookupType::CustomerName, "Acme", "C1", CacheSource::Backflow, 0.5)
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(
            store.get(&CacheKey::new(LookupType::CustomerName, "ACME")).unwrap().confidence,
            0.97
        );
    }

    #[tokio::test]
    async fn test_in_batch_duplicates_reduced() {
        let store = Arc::new(InMemoryCacheStore::new());
        let w = writer(&store);
        let candidates = vec![
            BackflowCandidate::new(LookupType::AccountName, "acme", "C2", CacheSource::Backflow, 0.7),
            BackflowCandidate::new(LookupType::AccountName, "ACME ", "C1", CacheSource::Backflow, 0.9),
            BackflowCandidate::new(LookupType::AccountName, "Acme", "C1", CacheSource::Backflow, 0.8),
        ];
        let report = w.record_batch(&candidates).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.conflicts_logged, 1);
        let entry = store.get(&CacheKey::new(LookupType::AccountName, "ACME")).unwrap();
        assert_eq!(entry.company_id, "C1");
        assert_eq!(entry.confidence, 0.9);
    }

    #[tokio::test]
    async fn test_same_key_different_types_coexist() {
        let store = Arc::new(InMemoryCacheStore::new());
        let w = writer(&store);
        w.record(LookupType::CustomerName, "Acme", "C_NEW", CacheSource::Backflow, 0.9)
            .await
            .unwrap();
        w.record(LookupType::FormerName, "Acme", "C_OLD", CacheSource::Backflow, 0.9)
            .await
            .unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.conflict_log().is_empty());
    }

    #[tokio::test]
    async fn test_learn_from_records() {
        let store = Arc::new(InMemoryCacheStore::new());
        let w = writer(&store);
        let records = vec![
            InputRecord::new("1").with_customer_name("Acme").with_company_id("C1"),
            InputRecord::new("2").with_customer_name("ACME ").with_company_id("C1"),
            InputRecord::new("3").with_customer_name("Beta").with_company_id("C2"),
            InputRecord::new("4").with_customer_name("Gamma").with_company_id("C3"),
            InputRecord::new("5").with_customer_name("Gamma").with_company_id("C4"),
            InputRecord::new("6").with_customer_name("Delta").with_company_id("IN_ABCDEFGHIJKLMNOP"),
            InputRecord::new("7").with_customer_name("Delta").with_company_id("IN_ABCDEFGHIJKLMNOP"),
        ];
        let report = w.learn_from_records("annuity", &records).await.unwrap();
        assert_eq!(report.inserted, 1);

        let entry = store.get(&CacheKey::new(LookupType::CustomerName, "ACME")).unwrap();
        assert_eq!(entry.company_id, "C1");
        assert_eq!(entry.source, CacheSource::DomainLearning);
        assert_eq!(entry.source_domain.as_deref(), Some("annuity"));
        assert!(store.get(&CacheKey::new(LookupType::CustomerName, "BETA")).is_none());
        assert!(store.get(&CacheKey::new(LookupType::CustomerName, "GAMMA")).is_none());
        assert!(store.get(&CacheKey::new(LookupType::CustomerName, "DELTA")).is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_propagates() {
        let store = Arc::new(InMemoryCacheStore::new());
        store.set_unavailable(true);
        let err = writer(&store)
            .record(LookupType::PlanCode, "P1", "C1", CacheSource::Backflow, 0.9)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheStoreError::Unavailable(_)));
    }
}
