//! In-process cache store.
//!
//! Same semantics as the Postgres store. Used by tests and by pipelines that
//! run without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::CacheStore;
use crate::error::CacheStoreError;
use crate::types::{
    CacheEntry, CacheKey, CacheSource, ConflictRecord, InsertBatchResult, MappingConflict,
};

#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    conflicts: Mutex<Vec<ConflictRecord>>,
    unavailable: AtomicBool,
    lookup_calls: AtomicUsize,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with entries, bypassing conflict checks.
    pub fn with_entries(entries: impl IntoIterator<Item = CacheEntry>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.entries.lock() {
            for entry in entries {
                map.insert(entry.key(), entry);
            }
        }
        store
    }

    /// Simulate a store that cannot be reached.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self
            .entries
            .lock()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.key().cmp(&b.key()));
        entries
    }

    pub fn conflict_log(&self) -> Vec<ConflictRecord> {
        self.conflicts
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Number of `lookup_batch` round trips served.
    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), CacheStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheStoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<CacheKey, CacheEntry>>, CacheStoreError> {
        self.entries
            .lock()
            .map_err(|_| CacheStoreError::Backend("cache mutex poisoned".to_string()))
    }
}

pub(crate) fn validate_entry(entry: &CacheEntry) -> Result<(), CacheStoreError> {
    let invalid = |reason: &str| CacheStoreError::InvalidEntry {
        lookup_type: entry.lookup_type.to_string(),
        lookup_key: entry.lookup_key.clone(),
        reason: reason.to_string(),
    };
    if entry.lookup_key.is_empty() {
        return Err(invalid("empty lookup key"));
    }
    if entry.company_id.trim().is_empty() {
        return Err(invalid("empty company id"));
    }
    if !(0.0..=1.0).contains(&entry.confidence) {
        return Err(invalid("confidence outside [0, 1]"));
    }
    Ok(())
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn lookup_batch(
        &self,
        keys: &[CacheKey],
    ) -> Result<HashMap<CacheKey, CacheEntry>, CacheStoreError> {
        self.check_available()?;
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        let map = self.entries()?;
        Ok(keys
            .iter()
            .filter_map(|k| map.get(k).map(|e| (k.clone(), e.clone())))
            .collect())
    }

    async fn insert_batch(
        &self,
        entries: &[CacheEntry],
    ) -> Result<InsertBatchResult, CacheStoreError> {
        self.check_available()?;
        for entry in entries {
            validate_entry(entry)?;
        }

        let mut map = self.entries()?;
        let mut result = InsertBatchResult::default();
        for entry in entries {
            match map.get(&entry.key()) {
                None => {
                    map.insert(entry.key(), entry.clone());
                    result.inserted += 1;
                }
                Some(existing) if existing.company_id == entry.company_id => {
                    result.skipped += 1;
                }
                Some(existing) => {
                    result.conflicts.push(MappingConflict {
                        existing: existing.clone(),
                        candidate: entry.clone(),
                    });
                }
            }
        }
        Ok(result)
    }

    async fn replace_if_unchanged(
        &self,
        current: &CacheEntry,
        replacement: &CacheEntry,
    ) -> Result<bool, CacheStoreError> {
        self.check_available()?;
        validate_entry(replacement)?;

        let mut map = self.entries()?;
        let Some(stored) = map.get_mut(&current.key()) else {
            return Ok(false);
        };
        if stored.company_id != current.company_id
            || stored.source != current.source
            || stored.confidence != current.confidence
        {
            return Ok(false);
        }

        stored.company_id = replacement.company_id.clone();
        stored.confidence = replacement.confidence;
        stored.source = replacement.source;
        stored.source_domain = replacement.source_domain.clone();
        stored.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_hits(&self, keys: &[CacheKey]) -> Result<(), CacheStoreError> {
        self.check_available()?;
        let now = Utc::now();
        let mut map = self.entries()?;
        for key in keys {
            if let Some(entry) = map.get_mut(key) {
                entry.hit_count += 1;
                entry.last_hit_at = Some(now);
            }
        }
        Ok(())
    }

    async fn append_conflicts(&self, records: &[ConflictRecord]) -> Result<(), CacheStoreError> {
        self.check_available()?;
        self.conflicts
            .lock()
            .map_err(|_| CacheStoreError::Backend("conflict log mutex poisoned".to_string()))?
            .extend_from_slice(records);
        Ok(())
    }

    async fn count_by_source(&self) -> Result<HashMap<CacheSource, u64>, CacheStoreError> {
        self.check_available()?;
        let map = self.entries()?;
        let mut counts = HashMap::new();
        for entry in map.values() {
            *counts.entry(entry.source).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LookupType;

    fn entry(key: &str, company: &str) -> CacheEntry {
        CacheEntry::new(LookupType::CustomerName, key, company, CacheSource::Backflow, 0.9)
    }

    #[tokio::test]
    async fn test_lookup_batch_omits_missing_keys() {
        let store = InMemoryCacheStore::with_entries([entry("ABC", "C1")]);
        let keys = vec![
            CacheKey::new(LookupType::CustomerName, "ABC"),
            CacheKey::new(LookupType::CustomerName, "XYZ"),
        ];
        let found = store.lookup_batch(&keys).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[&keys[0]].company_id, "C1");
        assert_eq!(store.lookup_calls(), 1);
    }

    #[tokio::test]
    async fn test_type_is_part_of_identity() {
        let store = InMemoryCacheStore::new();
        let current = CacheEntry::new(LookupType::CustomerName, "OLDCO", "C1", CacheSource::Manual, 1.0);
        let former = CacheEntry::new(LookupType::FormerName, "OLDCO", "C2", CacheSource::Manual, 1.0);
        let result = store.insert_batch(&[current, former]).await.unwrap();
        assert_eq!(result.inserted, 2);
        assert!(result.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = InMemoryCacheStore::new();
        store.insert_batch(&[entry("ABC", "C1")]).await.unwrap();
        let before = store.snapshot();

        let result = store.insert_batch(&[entry("ABC", "C1")]).await.unwrap();
        assert_eq!(result.inserted, 0);
        assert_eq!(result.skipped, 1);

        let after = store.snapshot();
        assert_eq!(before.len(), after.len());
        assert_eq!(before[0].company_id, after[0].company_id);
        assert_eq!(before[0].confidence, after[0].confidence);
        assert_eq!(before[0].created_at, after[0].created_at);
    }

    #[tokio::test]
    async fn test_conflict_reported_not_written() {
        let store = InMemoryCacheStore::with_entries([entry("ABC", "C1")]);
        let result = store.insert_batch(&[entry("ABC", "C2")]).await.unwrap();
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].existing.company_id, "C1");
        let stored = store.get(&CacheKey::new(LookupType::CustomerName, "ABC")).unwrap();
        assert_eq!(stored.company_id, "C1");
    }

    #[tokio::test]
    async fn test_replace_if_unchanged_detects_lost_race() {
        let original = entry("ABC", "C1");
        let store = InMemoryCacheStore::with_entries([original.clone()]);

        let winner = CacheEntry::new(LookupType::CustomerName, "ABC", "C2", CacheSource::ExternalApi, 0.95);
        assert!(store.replace_if_unchanged(&original, &winner).await.unwrap());

        // A second writer still holding the original view loses.
        let late = CacheEntry::new(LookupType::CustomerName, "ABC", "C3", CacheSource::ExternalApi, 0.99);
        assert!(!store.replace_if_unchanged(&original, &late).await.unwrap());

        let stored = store.get(&original.key()).unwrap();
        assert_eq!(stored.company_id, "C2");
    }

    #[tokio::test]
    async fn test_record_hits_updates_statistics() {
        let store = InMemoryCacheStore::with_entries([entry("ABC", "C1")]);
        let key = CacheKey::new(LookupType::CustomerName, "ABC");
        store.record_hits(&[key.clone(), key.clone()]).await.unwrap();
        let stored = store.get(&key).unwrap();
        assert_eq!(stored.hit_count, 2);
        assert!(stored.last_hit_at.is_some());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_reads() {
        let store = InMemoryCacheStore::new();
        store.set_unavailable(true);
        let err = store.lookup_batch(&[]).await.unwrap_err();
        assert!(matches!(err, CacheStoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_invalid_entry_rejected() {
        let store = InMemoryCacheStore::new();
        let err = store.insert_batch(&[entry("", "C1")]).await.unwrap_err();
        assert!(matches!(err, CacheStoreError::InvalidEntry { .. }));
    }
}
