//! Engine configuration loaded from YAML with environment overrides.
//!
//! The configuration is an explicit value handed to the resolver, worker and
//! temp identity generator at construction time; nothing reads it from a
//! global.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::normalize::normalize;
use crate::policy::SourceTrustPolicy;
use crate::temp_id::{TempIdKeyStrategy, DEFAULT_TEMP_ID_PREFIX};
use crate::types::{CacheKey, CacheSource, LookupType};

pub const ENV_ENABLED: &str = "COMPANY_ENRICHMENT_ENABLED";
pub const ENV_SALT: &str = "COMPANY_ID_SALT";
pub const ENV_SYNC_BUDGET: &str = "COMPANY_SYNC_BUDGET";
pub const ENV_LOOKUP_URL: &str = "COMPANY_LOOKUP_URL";
pub const ENV_LOOKUP_TOKEN: &str = "COMPANY_LOOKUP_TOKEN";
pub const ENV_QUEUE_BATCH_SIZE: &str = "COMPANY_QUEUE_BATCH_SIZE";
pub const ENV_QUEUE_MAX_ATTEMPTS: &str = "COMPANY_QUEUE_MAX_ATTEMPTS";

// ---------------------------------------------------------------------------
// EnrichmentConfig
// ---------------------------------------------------------------------------

/// Root configuration for the resolution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// When false every record falls straight through to a temp identity.
    pub enabled: bool,
    /// Secret salt for temp identities. Must be stable across runs.
    pub salt: String,
    pub temp_id_prefix: String,
    pub temp_id_key: TempIdKeyStrategy,
    /// Ceiling on synchronous external lookups per resolver run.
    pub sync_budget: u32,
    /// Minimum candidate score accepted as a match.
    pub min_match_score: f64,
    /// Confidence of mappings backflowed from a resolved record.
    pub backflow_confidence: f64,
    /// Confidence reported for identifiers already present on the record.
    pub existing_column_confidence: f64,
    pub domain_learning: DomainLearningConfig,
    pub queue: QueueConfig,
    pub external: ExternalConfig,
    /// Per-source trust ranks, overlaid on the defaults.
    pub trust: HashMap<CacheSource, u8>,
    pub overrides: OverrideTable,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            salt: String::new(),
            temp_id_prefix: DEFAULT_TEMP_ID_PREFIX.to_string(),
            temp_id_key: TempIdKeyStrategy::NameOnly,
            sync_budget: 0,
            min_match_score: 0.90,
            backflow_confidence: 0.90,
            existing_column_confidence: 1.0,
            domain_learning: DomainLearningConfig::default(),
            queue: QueueConfig::default(),
            external: ExternalConfig::default(),
            trust: HashMap::new(),
            overrides: OverrideTable::default(),
        }
    }
}

impl EnrichmentConfig {
    /// Load from a YAML file, overlay the process environment and validate.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        let mut config: EnrichmentConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Parsing {}", path.display()))?;
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config
            .validate()
            .with_context(|| format!("Validating {}", path.display()))?;
        Ok(config)
    }

    /// Build from defaults plus the process environment only.
    pub fn from_env() -> Result<Self> {
        let mut config = EnrichmentConfig::default();
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay settings from environment variables.
    ///
    /// The lookup takes a variable name so tests can supply their own
    /// environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_ENABLED) {
            self.enabled = parse_bool(&v).ok_or_else(|| ConfigError::Invalid {
                field: "enabled",
                reason: format!("expected a boolean, got '{v}'"),
            })?;
        }
        if let Some(v) = lookup(ENV_SALT) {
            self.salt = v;
        }
        if let Some(v) = lookup(ENV_SYNC_BUDGET) {
            self.sync_budget = v.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "sync_budget",
                reason: format!("expected a non-negative integer, got '{v}'"),
            })?;
        }
        if let Some(v) = lookup(ENV_LOOKUP_URL) {
            self.external.base_url = Some(v);
        }
        if let Some(v) = lookup(ENV_LOOKUP_TOKEN) {
            self.external.api_token = Some(v);
        }
        if let Some(v) = lookup(ENV_QUEUE_BATCH_SIZE) {
            self.queue.batch_size = v.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "queue.batch_size",
                reason: format!("expected a positive integer, got '{v}'"),
            })?;
        }
        if let Some(v) = lookup(ENV_QUEUE_MAX_ATTEMPTS) {
            self.queue.max_attempts = v.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "queue.max_attempts",
                reason: format!("expected a positive integer, got '{v}'"),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.salt.is_empty() {
            return Err(ConfigError::Missing("salt"));
        }
        if self.temp_id_prefix.is_empty() {
            return Err(ConfigError::Missing("temp_id_prefix"));
        }
        for (field, value) in [
            ("min_match_score", self.min_match_score),
            ("backflow_confidence", self.backflow_confidence),
            ("existing_column_confidence", self.existing_column_confidence),
            ("domain_learning.confidence", self.domain_learning.confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} is outside [0, 1]"),
                });
            }
        }
        if self.queue.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "queue.batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.queue.max_attempts < 1 {
            return Err(ConfigError::Invalid {
                field: "queue.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(url) = &self.external.base_url {
            url::Url::parse(url).map_err(|e| ConfigError::Invalid {
                field: "external.base_url",
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn trust_policy(&self) -> SourceTrustPolicy {
        SourceTrustPolicy::default().with_overrides(&self.trust)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Sub-sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainLearningConfig {
    /// A key must be seen this many times, always with the same company.
    pub min_occurrences: usize,
    pub confidence: f64,
}

impl Default for DomainLearningConfig {
    fn default() -> Self {
        Self {
            min_occurrences: 2,
            confidence: 0.85,
        }
    }
}

/// Async consumer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub batch_size: usize,
    /// Attempts before an entry moves to `failed`.
    pub max_attempts: i32,
    pub workers: usize,
    pub poll_interval_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// `processing` entries older than this are returned to `pending`.
    pub stale_after_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_attempts: 5,
            workers: 2,
            poll_interval_secs: 10,
            backoff_base_secs: 30,
            backoff_max_secs: 3600,
            stale_after_secs: 900,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// External lookup client settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalConfig {
    pub base_url: Option<String>,
    /// Bearer credential. Only ever read from the environment.
    #[serde(skip)]
    pub api_token: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub min_request_interval_ms: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_secs: u64,
    pub search_limit: usize,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_token: None,
            timeout_secs: 10,
            max_retries: 3,
            retry_base_ms: 200,
            retry_max_ms: 5_000,
            min_request_interval_ms: 200,
            circuit_failure_threshold: 5,
            circuit_cooldown_secs: 60,
            search_limit: 10,
        }
    }
}

impl std::fmt::Debug for ExternalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalConfig")
            .field("base_url", &self.base_url)
            .field(
                "api_token",
                &self.api_token.as_ref().map(|_| "<redacted>"),
            )
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("retry_base_ms", &self.retry_base_ms)
            .field("retry_max_ms", &self.retry_max_ms)
            .field("min_request_interval_ms", &self.min_request_interval_ms)
            .field("circuit_failure_threshold", &self.circuit_failure_threshold)
            .field("circuit_cooldown_secs", &self.circuit_cooldown_secs)
            .field("search_limit", &self.search_limit)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// OverrideTable
// ---------------------------------------------------------------------------

/// Operator-maintained `(lookup_type, key) -> company_id` mappings.
///
/// Keys are normalized at load so they match what the resolver looks up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawOverrides", into = "RawOverrides")]
pub struct OverrideTable {
    entries: HashMap<CacheKey, String>,
}

type RawOverrides = BTreeMap<LookupType, BTreeMap<String, String>>;

impl From<RawOverrides> for OverrideTable {
    fn from(raw: RawOverrides) -> Self {
        let mut table = OverrideTable::default();
        for (lookup_type, mappings) in raw {
            for (key, company_id) in mappings {
                table.insert(lookup_type, &key, company_id);
            }
        }
        table
    }
}

impl From<OverrideTable> for RawOverrides {
    fn from(table: OverrideTable) -> Self {
        let mut raw = RawOverrides::new();
        for (key, company_id) in table.entries {
            raw.entry(key.lookup_type)
                .or_default()
                .insert(key.lookup_key, company_id);
        }
        raw
    }
}

impl OverrideTable {
    /// Add an override. Placeholder keys and empty ids are ignored.
    pub fn insert(&mut self, lookup_type: LookupType, raw_key: &str, company_id: impl Into<String>) {
        let key = normalize(raw_key);
        let company_id = company_id.into();
        if key.is_empty() || company_id.trim().is_empty() {
            tracing::warn!(
                lookup_type = %lookup_type,
                raw_key = %raw_key,
                "Ignoring override with empty key or company id"
            );
            return;
        }
        self.entries
            .insert(CacheKey::new(lookup_type, key), company_id.trim().to_string());
    }

    pub fn get(&self, lookup_type: LookupType, normalized_key: &str) -> Option<&str> {
        self.entries
            .get(&CacheKey::new(lookup_type, normalized_key))
            .map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_YAML: &str = r#"
salt: "unit-test-salt"
sync_budget: 25
min_match_score: 0.8
queue:
  batch_size: 10
  max_attempts: 3
external:
  base_url: "https://lookup.example.com/api/v1"
  timeout_secs: 5
trust:
  migrated: 95
overrides:
  plan_code:
    " p0001 ": "614810477"
  customer_name:
    "中国平安（集团）": "600000001"
"#;

    #[test]
    fn test_parse_yaml_with_defaults() {
        let config: EnrichmentConfig = serde_yaml::from_str(SAMPLE_YAML).unwrap();
        assert!(config.enabled);
        assert_eq!(config.sync_budget, 25);
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.queue.max_attempts, 3);
        // untouched sub-fields keep defaults
        assert_eq!(config.queue.workers, 2);
        assert_eq!(config.external.max_retries, 3);
        assert_eq!(config.temp_id_prefix, "IN_");
        config.validate().unwrap();
    }

    #[test]
    fn test_override_keys_are_normalized() {
        let config: EnrichmentConfig = serde_yaml::from_str(SAMPLE_YAML).unwrap();
        assert_eq!(config.overrides.len(), 2);
        assert_eq!(
            config.overrides.get(LookupType::PlanCode, "P0001"),
            Some("614810477")
        );
        assert_eq!(
            config
                .overrides
                .get(LookupType::CustomerName, "中国平安(集团)"),
            Some("600000001")
        );
        assert_eq!(config.overrides.get(LookupType::AccountName, "P0001"), None);
    }

    #[test]
    fn test_trust_overrides_overlay_defaults() {
        let config: EnrichmentConfig = serde_yaml::from_str(SAMPLE_YAML).unwrap();
        let policy = config.trust_policy();
        assert_eq!(policy.rank(CacheSource::Migrated), 95);
        assert_eq!(policy.rank(CacheSource::ExternalApi), 80);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EnrichmentConfig::default();
        let env = HashMap::from([
            (ENV_ENABLED, "false"),
            (ENV_SALT, "from-env"),
            (ENV_SYNC_BUDGET, "7"),
            (ENV_LOOKUP_TOKEN, "secret-token"),
        ]);
        config
            .apply_env_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert!(!config.enabled);
        assert_eq!(config.salt, "from-env");
        assert_eq!(config.sync_budget, 7);
        assert_eq!(config.external.api_token.as_deref(), Some("secret-token"));
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = EnrichmentConfig::default();
        let err = config
            .apply_env_overrides(|name| (name == ENV_SYNC_BUDGET).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "sync_budget", .. }));
    }

    #[test]
    fn test_validate_requires_salt() {
        let config = EnrichmentConfig::default();
        assert_eq!(config.validate(), Err(ConfigError::Missing("salt")));
    }

    #[test]
    fn test_validate_rejects_out_of_range_score() {
        let config = EnrichmentConfig {
            salt: "s".to_string(),
            min_match_score: 1.5,
            ..EnrichmentConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "min_match_score", .. })
        ));
    }

    #[test]
    fn test_token_is_not_serialized_or_debug_printed() {
        let mut config = EnrichmentConfig {
            salt: "s".to_string(),
            ..EnrichmentConfig::default()
        };
        config.external.api_token = Some("super-secret".to_string());
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(!yaml.contains("super-secret"));
        assert!(!format!("{:?}", config).contains("super-secret"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE_YAML.as_bytes()).unwrap();
        let config = EnrichmentConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.min_match_score, 0.8);
        assert_eq!(config.external.timeout_secs, 5);
    }
}
