//! Postgres-backed company mapping cache.
//!
//! All batch operations bind parallel arrays and `UNNEST` them, so a whole
//! resolver batch costs one round trip per operation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::memory::validate_entry;
use super::CacheStore;
use crate::error::CacheStoreError;
use crate::types::{
    CacheEntry, CacheKey, CacheSource, ConflictRecord, InsertBatchResult, LookupType,
    MappingConflict,
};

#[derive(Debug, sqlx::FromRow)]
struct CacheRow {
    lookup_key: String,
    lookup_type: String,
    company_id: String,
    confidence: f64,
    source: String,
    source_domain: Option<String>,
    hit_count: i64,
    last_hit_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CacheRow> for CacheEntry {
    type Error = CacheStoreError;

    fn try_from(row: CacheRow) -> Result<Self, Self::Error> {
        let invalid = |reason: String| CacheStoreError::InvalidEntry {
            lookup_type: row.lookup_type.clone(),
            lookup_key: row.lookup_key.clone(),
            reason,
        };
        let lookup_type = LookupType::parse(&row.lookup_type)
            .ok_or_else(|| invalid(format!("unknown lookup_type '{}'", row.lookup_type)))?;
        let source = CacheSource::parse(&row.source)
            .ok_or_else(|| invalid(format!("unknown source '{}'", row.source)))?;
        Ok(CacheEntry {
            lookup_key: row.lookup_key,
            lookup_type,
            company_id: row.company_id,
            confidence: row.confidence,
            source,
            source_domain: row.source_domain,
            hit_count: row.hit_count,
            last_hit_at: row.last_hit_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres store for `enrichment.company_mapping_cache`.
#[derive(Clone)]
pub struct PgCacheStore {
    pool: PgPool,
}

impl PgCacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_keys(
        &self,
        keys: &[CacheKey],
    ) -> Result<HashMap<CacheKey, CacheEntry>, CacheStoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let types: Vec<String> = keys.iter().map(|k| k.lookup_type.as_str().to_string()).collect();
        let values: Vec<String> = keys.iter().map(|k| k.lookup_key.clone()).collect();

        let rows = sqlx::query_as::<_, CacheRow>(
            r#"
            SELECT c.lookup_key, c.lookup_type, c.company_id, c.confidence,
                   c.source, c.source_domain, c.hit_count, c.last_hit_at,
                   c.created_at, c.updated_at
            FROM enrichment.company_mapping_cache c
            JOIN UNNEST($1::text[], $2::text[]) AS k(lookup_type, lookup_key)
              ON c.lookup_type = k.lookup_type AND c.lookup_key = k.lookup_key
            "#,
        )
        .bind(&types)
        .bind(&values)
        .fetch_all(&self.pool)
        .await?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in rows {
            let entry = CacheEntry::try_from(row)?;
            found.insert(entry.key(), entry);
        }
        Ok(found)
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn lookup_batch(
        &self,
        keys: &[CacheKey],
    ) -> Result<HashMap<CacheKey, CacheEntry>, CacheStoreError> {
        self.fetch_keys(keys).await
    }

    async fn insert_batch(
        &self,
        entries: &[CacheEntry],
    ) -> Result<InsertBatchResult, CacheStoreError> {
        if entries.is_empty() {
            return Ok(InsertBatchResult::default());
        }
        for entry in entries {
            validate_entry(entry)?;
        }

        let inserted: Vec<(String, String)> = sqlx::query_as(
            r#"
            INSERT INTO enrichment.company_mapping_cache
                (lookup_type, lookup_key, company_id, confidence, source, source_domain,
                 hit_count, created_at, updated_at)
            SELECT t.lookup_type, t.lookup_key, t.company_id, t.confidence, t.source,
                   t.source_domain, 0, now(), now()
            FROM UNNEST($1::text[], $2::text[], $3::text[], $4::float8[], $5::text[], $6::text[])
                AS t(lookup_type, lookup_key, company_id, confidence, source, source_domain)
            ON CONFLICT (lookup_type, lookup_key) DO NOTHING
            RETURNING lookup_type, lookup_key
            "#,
        )
        .bind(entries.iter().map(|e| e.lookup_type.as_str().to_string()).collect::<Vec<_>>())
        .bind(entries.iter().map(|e| e.lookup_key.clone()).collect::<Vec<_>>())
        .bind(entries.iter().map(|e| e.company_id.clone()).collect::<Vec<_>>())
        .bind(entries.iter().map(|e| e.confidence).collect::<Vec<_>>())
        .bind(entries.iter().map(|e| e.source.as_str().to_string()).collect::<Vec<_>>())
        .bind(entries.iter().map(|e| e.source_domain.clone()).collect::<Vec<_>>())
        .fetch_all(&self.pool)
        .await?;

        let inserted_keys: std::collections::HashSet<(String, String)> =
            inserted.into_iter().collect();

        let remaining: Vec<&CacheEntry> = entries
            .iter()
            .filter(|e| {
                !inserted_keys.contains(&(e.lookup_type.as_str().to_string(), e.lookup_key.clone()))
            })
            .collect();

        let mut result = InsertBatchResult {
            inserted: inserted_keys.len(),
            ..InsertBatchResult::default()
        };
        if remaining.is_empty() {
            return Ok(result);
        }

        let existing = self
            .fetch_keys(&remaining.iter().map(|e| e.key()).collect::<Vec<_>>())
            .await?;
        for candidate in remaining {
            match existing.get(&candidate.key()) {
                Some(stored) if stored.company_id != candidate.company_id => {
                    result.conflicts.push(MappingConflict {
                        existing: stored.clone(),
                        candidate: candidate.clone(),
                    });
                }
                _ => result.skipped += 1,
            }
        }
        Ok(result)
    }

    async fn replace_if_unchanged(
        &self,
        current: &CacheEntry,
        replacement: &CacheEntry,
    ) -> Result<bool, CacheStoreError> {
        validate_entry(replacement)?;
        let result = sqlx::query(
            r#"
            UPDATE enrichment.company_mapping_cache
            SET company_id = $3,
                confidence = $4,
                source = $5,
                source_domain = $6,
                updated_at = now()
            WHERE lookup_type = $1
              AND lookup_key = $2
              AND company_id = $7
              AND source = $8
              AND confidence = $9
            "#,
        )
        .bind(current.lookup_type.as_str())
        .bind(&current.lookup_key)
        .bind(&replacement.company_id)
        .bind(replacement.confidence)
        .bind(replacement.source.as_str())
        .bind(&replacement.source_domain)
        .bind(&current.company_id)
        .bind(current.source.as_str())
        .bind(current.confidence)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_hits(&self, keys: &[CacheKey]) -> Result<(), CacheStoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut hits: HashMap<&CacheKey, i64> = HashMap::new();
        for key in keys {
            *hits.entry(key).or_insert(0) += 1;
        }
        let types: Vec<String> = hits.keys().map(|k| k.lookup_type.as_str().to_string()).collect();
        let values: Vec<String> = hits.keys().map(|k| k.lookup_key.clone()).collect();
        let counts: Vec<i64> = hits.values().copied().collect();

        sqlx::query(
            r#"
            UPDATE enrichment.company_mapping_cache c
            SET hit_count = c.hit_count + k.hits,
                last_hit_at = now()
            FROM UNNEST($1::text[], $2::text[], $3::bigint[]) AS k(lookup_type, lookup_key, hits)
            WHERE c.lookup_type = k.lookup_type AND c.lookup_key = k.lookup_key
            "#,
        )
        .bind(&types)
        .bind(&values)
        .bind(&counts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_conflicts(&self, records: &[ConflictRecord]) -> Result<(), CacheStoreError> {
        if records.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO enrichment.company_mapping_conflicts
                (lookup_type, lookup_key, winner_company_id, winner_source, winner_confidence,
                 loser_company_id, loser_source, loser_confidence, recorded_at)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::float8[],
                                 $6::text[], $7::text[], $8::float8[], $9::timestamptz[])
            "#,
        )
        .bind(records.iter().map(|r| r.lookup_type.as_str().to_string()).collect::<Vec<_>>())
        .bind(records.iter().map(|r| r.lookup_key.clone()).collect::<Vec<_>>())
        .bind(records.iter().map(|r| r.winner_company_id.clone()).collect::<Vec<_>>())
        .bind(records.iter().map(|r| r.winner_source.as_str().to_string()).collect::<Vec<_>>())
        .bind(records.iter().map(|r| r.winner_confidence).collect::<Vec<_>>())
        .bind(records.iter().map(|r| r.loser_company_id.clone()).collect::<Vec<_>>())
        .bind(records.iter().map(|r| r.loser_source.as_str().to_string()).collect::<Vec<_>>())
        .bind(records.iter().map(|r| r.loser_confidence).collect::<Vec<_>>())
        .bind(records.iter().map(|r| r.recorded_at).collect::<Vec<_>>())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_by_source(&self) -> Result<HashMap<CacheSource, u64>, CacheStoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT source, COUNT(*)
            FROM enrichment.company_mapping_cache
            GROUP BY source
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for (source, count) in rows {
            match CacheSource::parse(&source) {
                Some(s) => {
                    counts.insert(s, count.max(0) as u64);
                }
                None => tracing::warn!(source = %source, "Unknown cache source in store"),
            }
        }
        Ok(counts)
    }
}
