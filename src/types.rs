//! Core types for company identity resolution.
//!
//! Stored types (`CacheEntry`, `QueueEntry`) carry `as_str`/`parse` pairs on
//! their enums so the Postgres stores can persist them as plain text columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::normalize::normalize_detailed;

// ─── Lookup Types ────────────────────────────────────────────────────────────

/// Category of identifier being matched against the mapping cache.
///
/// The type is part of a cache entry's identity: the same key may map to
/// different companies under different types (a current name of one company
/// can be the former name of another).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupType {
    PlanCode,
    AccountNumber,
    AccountName,
    CustomerName,
    FormerName,
}

impl LookupType {
    /// All lookup types in cascade priority order.
    pub const ALL: [LookupType; 5] = [
        LookupType::PlanCode,
        LookupType::AccountNumber,
        LookupType::AccountName,
        LookupType::CustomerName,
        LookupType::FormerName,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanCode => "plan_code",
            Self::AccountNumber => "account_number",
            Self::AccountName => "account_name",
            Self::CustomerName => "customer_name",
            Self::FormerName => "former_name",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plan_code" => Some(Self::PlanCode),
            "account_number" => Some(Self::AccountNumber),
            "account_name" => Some(Self::AccountName),
            "customer_name" => Some(Self::CustomerName),
            "former_name" => Some(Self::FormerName),
            _ => None,
        }
    }

    /// Structured identifiers have lower ambiguity than free-text names and
    /// are tried first.
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::PlanCode | Self::AccountNumber)
    }

    /// Lower value = tried earlier.
    pub fn priority(&self) -> u8 {
        match self {
            Self::PlanCode => 1,
            Self::AccountNumber => 2,
            Self::AccountName => 3,
            Self::CustomerName => 4,
            Self::FormerName => 5,
        }
    }
}

impl std::fmt::Display for LookupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Cache Entry ─────────────────────────────────────────────────────────────

/// Where a cache mapping came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    ConfigOverride,
    ExternalApi,
    Manual,
    Backflow,
    DomainLearning,
    Migrated,
}

impl CacheSource {
    pub const ALL: [CacheSource; 6] = [
        CacheSource::ConfigOverride,
        CacheSource::ExternalApi,
        CacheSource::Manual,
        CacheSource::Backflow,
        CacheSource::DomainLearning,
        CacheSource::Migrated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigOverride => "config_override",
            Self::ExternalApi => "external_api",
            Self::Manual => "manual",
            Self::Backflow => "backflow",
            Self::DomainLearning => "domain_learning",
            Self::Migrated => "migrated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "config_override" => Some(Self::ConfigOverride),
            "external_api" => Some(Self::ExternalApi),
            "manual" => Some(Self::Manual),
            "backflow" => Some(Self::Backflow),
            "domain_learning" => Some(Self::DomainLearning),
            "migrated" => Some(Self::Migrated),
            _ => None,
        }
    }
}

impl std::fmt::Display for CacheSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identity of a cache entry: `(lookup_type, lookup_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub lookup_type: LookupType,
    pub lookup_key: String,
}

impl CacheKey {
    pub fn new(lookup_type: LookupType, lookup_key: impl Into<String>) -> Self {
        Self {
            lookup_type,
            lookup_key: lookup_key.into(),
        }
    }
}

/// A persisted `(lookup_type, lookup_key) -> company_id` mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub lookup_key: String,
    pub lookup_type: LookupType,
    pub company_id: String,
    /// Trust in the mapping, in `[0, 1]`.
    pub confidence: f64,
    pub source: CacheSource,
    /// Pipeline domain that produced the mapping, for audit.
    pub source_domain: Option<String>,
    pub hit_count: i64,
    pub last_hit_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    /// A fresh entry with zeroed hit statistics. Confidence is clamped to `[0, 1]`.
    pub fn new(
        lookup_type: LookupType,
        lookup_key: impl Into<String>,
        company_id: impl Into<String>,
        source: CacheSource,
        confidence: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            lookup_key: lookup_key.into(),
            lookup_type,
            company_id: company_id.into(),
            confidence: clamp_confidence(confidence),
            source,
            source_domain: None,
            hit_count: 0,
            last_hit_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_source_domain(mut self, domain: impl Into<String>) -> Self {
        self.source_domain = Some(domain.into());
        self
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.lookup_type, self.lookup_key.clone())
    }
}

/// Outcome of `CacheStore::insert_batch`.
///
/// Conflicting entries are reported back, never written.
#[derive(Debug, Clone, Default)]
pub struct InsertBatchResult {
    pub inserted: usize,
    pub skipped: usize,
    pub conflicts: Vec<MappingConflict>,
}

/// A candidate that disagrees with the stored entry for the same key.
#[derive(Debug, Clone)]
pub struct MappingConflict {
    pub existing: CacheEntry,
    pub candidate: CacheEntry,
}

/// Append-only audit row for the losing side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub lookup_type: LookupType,
    pub lookup_key: String,
    pub winner_company_id: String,
    pub winner_source: CacheSource,
    pub winner_confidence: f64,
    pub loser_company_id: String,
    pub loser_source: CacheSource,
    pub loser_confidence: f64,
    pub recorded_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn new(winner: &CacheEntry, loser: &CacheEntry) -> Self {
        Self {
            lookup_type: winner.lookup_type,
            lookup_key: winner.lookup_key.clone(),
            winner_company_id: winner.company_id.clone(),
            winner_source: winner.source,
            winner_confidence: winner.confidence,
            loser_company_id: loser.company_id.clone(),
            loser_source: loser.source,
            loser_confidence: loser.confidence,
            recorded_at: Utc::now(),
        }
    }
}

pub(crate) fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

// ─── Enrichment Queue ────────────────────────────────────────────────────────

/// Status of an enrichment queue entry.
///
/// `pending -> processing -> done | failed`, or back to `pending` after a
/// transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// An unresolved name waiting for an asynchronous external lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub raw_name: String,
    pub normalized_name: String,
    /// Record field the name came from; learned mappings are written under it.
    pub lookup_type: LookupType,
    /// Temp identity handed out when the name was enqueued.
    pub temp_id: Option<String>,
    pub status: QueueStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    /// Company found by the consumer; `None` on a `done` entry means no match.
    pub resolved_company_id: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A name to enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQueueEntry {
    pub raw_name: String,
    pub normalized_name: String,
    pub lookup_type: LookupType,
    pub temp_id: Option<String>,
}

/// Counts of queue entries per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
}

// ─── Resolution ──────────────────────────────────────────────────────────────

/// Which cascade step produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Override,
    Cache,
    ExistingColumn,
    ExternalSync,
    Temp,
}

impl ResolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Override => "override",
            Self::Cache => "cache",
            Self::ExistingColumn => "existing_column",
            Self::ExternalSync => "external_sync",
            Self::Temp => "temp",
        }
    }
}

/// Per-record output of the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub company_id: String,
    pub source: ResolutionSource,
    pub confidence: f64,
    /// Lookup type that matched, for cache and override hits.
    pub matched_type: Option<LookupType>,
}

impl ResolutionResult {
    pub fn is_provisional(&self) -> bool {
        self.source == ResolutionSource::Temp
    }
}

/// One business record as seen by the resolver.
///
/// Which pipeline column feeds which field is domain configuration and
/// happens before the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    pub record_id: String,
    #[serde(default)]
    pub plan_code: Option<String>,
    #[serde(default)]
    pub account_number: Option<String>,
    #[serde(default)]
    pub account_name: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    /// Identifier already present on the row.
    #[serde(default)]
    pub company_id: Option<String>,
}

impl InputRecord {
    pub fn new(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            ..Self::default()
        }
    }

    pub fn with_plan_code(mut self, value: impl Into<String>) -> Self {
        self.plan_code = Some(value.into());
        self
    }

    pub fn with_account_number(mut self, value: impl Into<String>) -> Self {
        self.account_number = Some(value.into());
        self
    }

    pub fn with_account_name(mut self, value: impl Into<String>) -> Self {
        self.account_name = Some(value.into());
        self
    }

    pub fn with_customer_name(mut self, value: impl Into<String>) -> Self {
        self.customer_name = Some(value.into());
        self
    }

    pub fn with_company_id(mut self, value: impl Into<String>) -> Self {
        self.company_id = Some(value.into());
        self
    }

    /// Raw values paired with the lookup type they are matched under, in
    /// cascade priority order. The customer name is also tried as a former
    /// name.
    pub fn signals(&self) -> Vec<(LookupType, &str)> {
        let mut signals = Vec::with_capacity(5);
        if let Some(v) = self.plan_code.as_deref() {
            signals.push((LookupType::PlanCode, v));
        }
        if let Some(v) = self.account_number.as_deref() {
            signals.push((LookupType::AccountNumber, v));
        }
        if let Some(v) = self.account_name.as_deref() {
            signals.push((LookupType::AccountName, v));
        }
        if let Some(v) = self.customer_name.as_deref() {
            signals.push((LookupType::CustomerName, v));
            signals.push((LookupType::FormerName, v));
        }
        signals
    }

    /// The free-text name used for external search and queueing.
    pub fn primary_name(&self) -> Option<&str> {
        self.primary_name_signal().map(|(_, raw)| raw)
    }

    /// The primary name together with the field it came from.
    ///
    /// Customer name first, then account name. A value that normalizes to
    /// the empty sentinel (blank, `N/A`, `null`) does not count.
    pub fn primary_name_signal(&self) -> Option<(LookupType, &str)> {
        usable_name(&self.customer_name)
            .map(|raw| (LookupType::CustomerName, raw))
            .or_else(|| usable_name(&self.account_name).map(|raw| (LookupType::AccountName, raw)))
    }

    /// The strongest structured code on the record.
    pub fn secondary_code(&self) -> Option<&str> {
        self.plan_code
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| {
                self.account_number
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
            })
    }
}

fn usable_name(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .filter(|raw| !normalize_detailed(raw).is_empty)
}
