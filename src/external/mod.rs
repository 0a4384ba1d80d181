//! External entity-search service integration
//!
//! This module provides:
//! - The `ExternalLookup` port used by the resolver and the queue consumer
//! - Candidate/detail types returned by the service
//! - `HttpLookupClient`, a rate-limited reqwest client with retries and a
//!   circuit breaker
//!
//! "Not found" is an empty result (`Ok(vec![])` / `Ok(None)`), never an error.

pub mod circuit;
pub mod client;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LookupError;
use crate::normalize::normalize;

pub use circuit::{CircuitBreaker, CircuitStatus};
pub use client::HttpLookupClient;
pub use retry::ExponentialBackoff;

/// A ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub company_id: String,
    pub official_name: String,
    /// Unified social credit / registration code, when the service has one.
    pub unified_code: Option<String>,
    pub aliases: Vec<String>,
    /// Match score in `[0, 1]`.
    pub score: f64,
}

/// Canonical record for one company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyDetail {
    pub company_id: String,
    pub official_name: String,
    pub unified_code: Option<String>,
    #[serde(default)]
    pub former_names: Vec<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[async_trait]
pub trait ExternalLookup: Send + Sync {
    /// Candidates ordered by descending score. Empty when nothing matches.
    async fn search_by_name(&self, name: &str) -> Result<Vec<Candidate>, LookupError>;

    /// Detail record, `None` when the id is unknown.
    async fn get_by_id(&self, company_id: &str) -> Result<Option<CompanyDetail>, LookupError>;
}

/// Local similarity between a query and a candidate, for hits the service
/// returned without a score. Exact normalized matches score 1.0.
pub fn local_score(query: &str, official_name: &str, aliases: &[String]) -> f64 {
    let query_key = normalize(query);
    if query_key.is_empty() {
        return 0.0;
    }
    std::iter::once(official_name)
        .chain(aliases.iter().map(|a| a.as_str()))
        .map(normalize)
        .filter(|k| !k.is_empty())
        .map(|k| {
            if k == query_key {
                1.0
            } else {
                strsim::jaro_winkler(&query_key, &k)
            }
        })
        .fold(0.0, f64::max)
}

/// Sort candidates by descending score, ties by id for stable output.
pub fn rank_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.company_id.cmp(&b.company_id))
    });
}

/// The top candidate if it clears `min_score`.
pub fn best_match(candidates: &[Candidate], min_score: f64) -> Option<&Candidate> {
    candidates
        .iter()
        .filter(|c| !c.company_id.trim().is_empty())
        .max_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.company_id.cmp(&a.company_id))
        })
        .filter(|c| c.score >= min_score)
}
