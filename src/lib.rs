//! Company Resolver - company identity resolution and enrichment
//!
//! Maps free-text company names and structured identifiers from business
//! records to canonical company ids, and gets better at it over time.
//!
//! ## Flow
//! Records -> Normalizer -> Resolver cascade (override, cache, existing id,
//! budgeted external search) -> hits backflow into the cache; misses get a
//! temp identity and are queued for the async `EnrichmentWorker`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use company_resolver::{
//!     CompanyResolver, EnrichmentConfig, InMemoryCacheStore, InMemoryEnrichmentQueue, InputRecord,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = EnrichmentConfig {
//!     salt: "change-me".to_string(),
//!     ..EnrichmentConfig::default()
//! };
//! let resolver = CompanyResolver::new(
//!     &config,
//!     Arc::new(InMemoryCacheStore::new()),
//!     Arc::new(InMemoryEnrichmentQueue::new()),
//!     None,
//! )?;
//! let outcome = resolver
//!     .resolve_batch(&[InputRecord::new("row-1").with_customer_name("  ABC 公司  ")])
//!     .await?;
//! assert_eq!(outcome.report.temp_assigned, 1);
//! # Ok(())
//! # }
//! ```

// Core error handling
pub mod error;

// Shared domain types
pub mod types;

// Configuration
pub mod config;

// Key derivation
pub mod normalize;
pub mod temp_id;

// Persistence ports and stores
pub mod cache;
pub mod queue;

// Database schema bootstrap (when enabled)
#[cfg(feature = "database")]
pub mod schema;

// External entity-search service
pub mod external;

// Conflict policy and cache writes
pub mod backflow;
pub mod policy;

// Resolution cascade and async consumer
pub mod consumer;
pub mod resolver;

pub use backflow::{BackflowCandidate, BackflowReport, BackflowWriter};
pub use cache::{CacheStore, InMemoryCacheStore};
pub use config::{EnrichmentConfig, OverrideTable};
pub use consumer::{EnrichmentWorker, ProcessReport, WorkerSettings};
pub use error::{
    CacheStoreError, ConfigError, LookupError, QueueError, ResolverError, TempIdError,
};
pub use external::{Candidate, CompanyDetail, ExternalLookup, HttpLookupClient};
pub use normalize::{normalize, normalize_detailed, NormalizedName};
pub use policy::{ConflictDecision, ConflictPolicy, SourceTrustPolicy};
pub use queue::{EnrichmentQueue, FailureDisposition, InMemoryEnrichmentQueue};
pub use resolver::{BatchOutcome, BatchReport, CompanyResolver, RecordOutcome};
pub use temp_id::TempIdGenerator;
pub use types::{
    CacheEntry, CacheKey, CacheSource, ConflictRecord, InputRecord, LookupType, QueueEntry,
    QueueStatus, ResolutionResult, ResolutionSource,
};

// Database integration re-exports (when database feature is enabled)
#[cfg(feature = "database")]
pub use cache::PgCacheStore;
#[cfg(feature = "database")]
pub use queue::PgEnrichmentQueue;
#[cfg(feature = "database")]
pub use schema::apply_schema;
