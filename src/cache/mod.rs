//! Company mapping cache
//!
//! Persistent `(lookup_type, lookup_key) -> company_id` mappings. Reads are
//! batched into one round trip per resolver batch. Writes never overwrite a
//! different company silently: `insert_batch` reports conflicts back and the
//! [`BackflowWriter`](crate::backflow::BackflowWriter) settles them through
//! the conflict policy and `replace_if_unchanged`.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::CacheStoreError;
use crate::types::{CacheEntry, CacheKey, CacheSource, ConflictRecord, InsertBatchResult};

pub use memory::InMemoryCacheStore;
#[cfg(feature = "database")]
pub use postgres::PgCacheStore;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up all keys in one round trip. Missing keys are absent from the map.
    async fn lookup_batch(
        &self,
        keys: &[CacheKey],
    ) -> Result<HashMap<CacheKey, CacheEntry>, CacheStoreError>;

    /// Insert new mappings.
    ///
    /// An existing key with the same `company_id` is skipped. An existing key
    /// with a different `company_id` is returned in `conflicts` and left
    /// untouched.
    async fn insert_batch(&self, entries: &[CacheEntry])
        -> Result<InsertBatchResult, CacheStoreError>;

    /// Compare-and-swap: write `replacement` only if the stored entry still
    /// has `current`'s company, confidence and source. Returns whether the
    /// write happened.
    async fn replace_if_unchanged(
        &self,
        current: &CacheEntry,
        replacement: &CacheEntry,
    ) -> Result<bool, CacheStoreError>;

    /// Bump `hit_count` and `last_hit_at`. Statistics only.
    async fn record_hits(&self, keys: &[CacheKey]) -> Result<(), CacheStoreError>;

    /// Append the losing side of a conflict to the audit trail.
    async fn append_conflicts(&self, records: &[ConflictRecord]) -> Result<(), CacheStoreError>;

    /// Entry counts per source, for audit reporting.
    async fn count_by_source(&self) -> Result<HashMap<CacheSource, u64>, CacheStoreError>;
}
