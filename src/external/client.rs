//! HTTP client for the external entity-search service
//!
//! Rate-limited reqwest client. Every request goes through the circuit
//! breaker, then the rate limiter, and transient failures are retried with
//! exponential backoff. The bearer credential is attached per request and
//! never written to logs or `Debug` output.
//!
//! Endpoints:
//! - `GET {base}/companies/search?name=..&limit=..` -> `{"data": [candidate, ...]}`
//! - `GET {base}/companies/{id}` -> `{"data": detail}`; 404 means unknown id

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::sleep;
use url::Url;

use super::circuit::CircuitBreaker;
use super::retry::ExponentialBackoff;
use super::{local_score, rank_candidates, Candidate, CompanyDetail, ExternalLookup};
use crate::config::ExternalConfig;
use crate::error::{ConfigError, LookupError, PermanentKind, TransientKind};

const ERROR_BODY_SNIPPET_CHARS: usize = 200;

// ----------------------------------------------------------------------------
// Wire types
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    #[serde(default, alias = "items", alias = "results")]
    data: Vec<WireCandidate>,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    #[serde(alias = "id")]
    company_id: String,
    #[serde(alias = "name")]
    official_name: String,
    #[serde(default, alias = "credit_code")]
    unified_code: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DetailEnvelope {
    data: CompanyDetail,
}

// ----------------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------------

pub struct HttpLookupClient {
    client: Client,
    base_url: Url,
    api_token: Option<String>,
    search_limit: usize,
    max_retries: u32,
    backoff: ExponentialBackoff,
    min_request_interval: Duration,
    last_request: Mutex<Option<Instant>>,
    circuit: CircuitBreaker,
}

impl std::fmt::Debug for HttpLookupClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLookupClient")
            .field("base_url", &self.base_url.as_str())
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("max_retries", &self.max_retries)
            .field("circuit", &self.circuit.status())
            .finish()
    }
}

impl HttpLookupClient {
    pub fn from_config(config: &ExternalConfig) -> Result<Self, ConfigError> {
        let raw = config
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("external.base_url"))?;

        let base_url = Url::parse(raw).map_err(|e| ConfigError::Invalid {
            field: "external.base_url",
            reason: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() || !matches!(base_url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                field: "external.base_url",
                reason: format!("'{raw}' is not an http(s) base URL"),
            });
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ConfigError::Invalid {
                field: "external",
                reason: format!("failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url,
            api_token: config.api_token.clone().filter(|t| !t.is_empty()),
            search_limit: config.search_limit.max(1),
            max_retries: config.max_retries,
            backoff: ExponentialBackoff::new(
                Duration::from_millis(config.retry_base_ms),
                Duration::from_millis(config.retry_max_ms),
            ),
            min_request_interval: Duration::from_millis(config.min_request_interval_ms),
            last_request: Mutex::new(None),
            circuit: CircuitBreaker::new(
                config.circuit_failure_threshold,
                Duration::from_secs(config.circuit_cooldown_secs),
            ),
        })
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Enforce spacing between requests. The lock is held across the sleep
    /// so concurrent callers queue up behind each other.
    async fn rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_request_interval {
                sleep(self.min_request_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, LookupError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                LookupError::permanent(PermanentKind::InvalidInput, "base URL cannot carry a path")
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn search_url(&self, name: &str) -> Result<Url, LookupError> {
        let mut url = self.endpoint(&["companies", "search"])?;
        url.query_pairs_mut()
            .append_pair("name", name)
            .append_pair("limit", &self.search_limit.to_string());
        Ok(url)
    }

    fn detail_url(&self, company_id: &str) -> Result<Url, LookupError> {
        self.endpoint(&["companies", company_id])
    }

    /// GET with circuit breaker, rate limit and retries.
    /// Returns the body, or `None` on 404.
    async fn get_with_retry(&self, url: &Url, op: &'static str) -> Result<Option<String>, LookupError> {
        let mut attempt: u32 = 0;
        loop {
            if !self.circuit.allow_request() {
                return Err(LookupError::transient(
                    TransientKind::CircuitOpen,
                    "external lookup circuit is open",
                ));
            }
            self.rate_limit().await;

            match self.get_once(url).await {
                Ok(body) => {
                    self.circuit.record_success();
                    return Ok(body);
                }
                Err(e) if e.is_transient() => {
                    self.circuit.record_failure();
                    attempt += 1;
                    if attempt > self.max_retries {
                        tracing::warn!(op, attempts = attempt, error = %e, "External lookup gave up");
                        return Err(e);
                    }
                    let delay = self.backoff.delay_for_attempt(attempt);
                    tracing::debug!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying external lookup"
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    // The service answered, so it is reachable.
                    self.circuit.record_success();
                    tracing::warn!(op, error = %e, "External lookup rejected");
                    return Err(e);
                }
            }
        }
    }

    async fn get_once(&self, url: &Url) -> Result<Option<String>, LookupError> {
        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body = response.text().await.map_err(classify_transport_error)?;
        match classify_status(status, &body) {
            Some(err) => Err(err),
            None => Ok(Some(body)),
        }
    }
}

#[async_trait]
impl ExternalLookup for HttpLookupClient {
    async fn search_by_name(&self, name: &str) -> Result<Vec<Candidate>, LookupError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LookupError::permanent(
                PermanentKind::InvalidInput,
                "search name is empty",
            ));
        }

        let url = self.search_url(name)?;
        match self.get_with_retry(&url, "search_by_name").await? {
            None => Ok(Vec::new()),
            Some(body) => {
                let candidates = parse_search_body(name, &body)?;
                tracing::debug!(candidates = candidates.len(), "External search completed");
                Ok(candidates)
            }
        }
    }

    async fn get_by_id(&self, company_id: &str) -> Result<Option<CompanyDetail>, LookupError> {
        let company_id = company_id.trim();
        if company_id.is_empty() {
            return Err(LookupError::permanent(
                PermanentKind::InvalidInput,
                "company id is empty",
            ));
        }

        let url = self.detail_url(company_id)?;
        match self.get_with_retry(&url, "get_by_id").await? {
            None => Ok(None),
            Some(body) => parse_detail_body(&body).map(Some),
        }
    }
}

// ----------------------------------------------------------------------------
// Response classification
// ----------------------------------------------------------------------------

/// Map a non-404 status to an error, `None` for success.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> Option<LookupError> {
    if status.is_success() {
        return None;
    }
    let message = format!("HTTP {}: {}", status.as_u16(), snippet(body));
    let err = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            LookupError::permanent(PermanentKind::Unauthorized, message)
        }
        StatusCode::TOO_MANY_REQUESTS => LookupError::transient(TransientKind::RateLimited, message),
        StatusCode::REQUEST_TIMEOUT => LookupError::transient(TransientKind::Timeout, message),
        s if s.is_server_error() => LookupError::transient(TransientKind::ServerError, message),
        _ => LookupError::permanent(PermanentKind::BadRequest, message),
    };
    Some(err)
}

fn classify_transport_error(e: reqwest::Error) -> LookupError {
    let e = e.without_url();
    if e.is_timeout() {
        LookupError::transient(TransientKind::Timeout, e.to_string())
    } else {
        LookupError::transient(TransientKind::Connection, e.to_string())
    }
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= ERROR_BODY_SNIPPET_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(ERROR_BODY_SNIPPET_CHARS).collect();
        format!("{cut}...")
    }
}

/// Service scores are `[0, 1]`; percentages are rescaled, missing or
/// unusable scores fall back to local similarity.
fn effective_score(query: &str, wire: &WireCandidate) -> f64 {
    match wire.score {
        Some(s) if s.is_finite() && (0.0..=1.0).contains(&s) => s,
        Some(s) if s.is_finite() && s > 1.0 && s <= 100.0 => s / 100.0,
        _ => local_score(query, &wire.official_name, &wire.aliases),
    }
}

pub(crate) fn parse_search_body(query: &str, body: &str) -> Result<Vec<Candidate>, LookupError> {
    let envelope: SearchEnvelope = serde_json::from_str(body).map_err(|e| {
        LookupError::permanent(
            PermanentKind::MalformedResponse,
            format!("search response: {e}"),
        )
    })?;

    let mut candidates: Vec<Candidate> = envelope
        .data
        .into_iter()
        .filter(|w| !w.company_id.trim().is_empty())
        .map(|w| {
            let score = effective_score(query, &w);
            Candidate {
                company_id: w.company_id.trim().to_string(),
                official_name: w.official_name,
                unified_code: w.unified_code.filter(|c| !c.trim().is_empty()),
                aliases: w.aliases,
                score,
            }
        })
        .collect();
    rank_candidates(&mut candidates);
    Ok(candidates)
}

pub(crate) fn parse_detail_body(body: &str) -> Result<CompanyDetail, LookupError> {
    let envelope: DetailEnvelope = serde_json::from_str(body).map_err(|e| {
        LookupError::permanent(
            PermanentKind::MalformedResponse,
            format!("detail response: {e}"),
        )
    })?;
    Ok(envelope.data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> ExternalConfig {
        ExternalConfig {
            base_url: Some(base_url.to_string()),
            api_token: Some("secret-token-value".to_string()),
            ..ExternalConfig::default()
        }
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::OK, "{}").is_none());

        let e = classify_status(StatusCode::UNAUTHORIZED, "").unwrap();
        assert!(matches!(
            e,
            LookupError::Permanent {
                kind: PermanentKind::Unauthorized,
                ..
            }
        ));
        let e = classify_status(StatusCode::FORBIDDEN, "").unwrap();
        assert!(!e.is_transient());

        let e = classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down").unwrap();
        assert!(matches!(
            e,
            LookupError::Transient {
                kind: TransientKind::RateLimited,
                ..
            }
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").unwrap().is_transient());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").unwrap().is_transient());

        let e = classify_status(StatusCode::BAD_REQUEST, "bad name").unwrap();
        assert!(matches!(
            e,
            LookupError::Permanent {
                kind: PermanentKind::BadRequest,
                ..
            }
        ));
    }

    #[test]
    fn test_error_snippet_truncated() {
        let body = "x".repeat(1000);
        let e = classify_status(StatusCode::INTERNAL_SERVER_ERROR, &body).unwrap();
        assert!(e.to_string().len() < 400);
    }

    #[test]
    fn test_parse_search_body_sorts_and_scores() {
        let body = r#"{"data": [
            {"id": "C2", "name": "Other Co", "score": 0.4},
            {"company_id": "C1", "official_name": "Acme", "credit_code": "91310000X", "score": 0.97},
            {"id": "C3", "name": "ABC公司"},
            {"id": "  ", "name": "Nameless"}
        ]}"#;
        let candidates = parse_search_body("abc 公司", body).unwrap();
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].company_id, "C3");
        assert_eq!(candidates[0].score, 1.0);
        assert_eq!(candidates[1].company_id, "C1");
        assert_eq!(candidates[1].unified_code.as_deref(), Some("91310000X"));
        assert_eq!(candidates[2].company_id, "C2");
    }

    #[test]
    fn test_parse_search_body_percent_scores() {
        let body = r#"{"data": [{"id": "C1", "name": "Acme", "score": 92}]}"#;
        let candidates = parse_search_body("Acme", body).unwrap();
        assert!((candidates[0].score - 0.92).abs() < 1e-9);
    }

    #[test]
    fn test_parse_malformed_body_is_permanent() {
        let e = parse_search_body("x", "<html>oops</html>").unwrap_err();
        assert!(matches!(
            e,
            LookupError::Permanent {
                kind: PermanentKind::MalformedResponse,
                ..
            }
        ));
        assert!(parse_detail_body("{}").is_err());
    }

    #[test]
    fn test_parse_detail_body() {
        let body = r#"{"data": {"company_id": "C1", "official_name": "Acme", "unified_code": null,
                        "former_names": ["Old Acme"]}}"#;
        let detail = parse_detail_body(body).unwrap();
        assert_eq!(detail.company_id, "C1");
        assert_eq!(detail.former_names, vec!["Old Acme".to_string()]);
        assert!(detail.status.is_none());
    }

    #[test]
    fn test_from_config_requires_base_url() {
        let err = HttpLookupClient::from_config(&ExternalConfig::default()).unwrap_err();
        assert_eq!(err, ConfigError::Missing("external.base_url"));

        let err = HttpLookupClient::from_config(&config("mailto:ops@example.com")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_urls_are_encoded() {
        let client = HttpLookupClient::from_config(&config("https://lookup.example.com/api/v2/")).unwrap();
        let url = client.search_url("A&B 公司").unwrap();
        assert!(url.as_str().starts_with("https://lookup.example.com/api/v2/companies/search?"));
        assert!(url.as_str().contains("name=A%26B+"));
        assert!(url.as_str().contains("limit=10"));

        let url = client.detail_url("C/1").unwrap();
        assert_eq!(url.as_str(), "https://lookup.example.com/api/v2/companies/C%2F1");
    }

    #[test]
    fn test_debug_redacts_token() {
        let client = HttpLookupClient::from_config(&config("https://lookup.example.com")).unwrap();
        let debug = format!("{client:?}");
        assert!(!debug.contains("secret-token-value"));
        assert!(debug.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_empty_name_rejected_without_request() {
        let client = HttpLookupClient::from_config(&config("http://127.0.0.1:9")).unwrap();
        let err = client.search_by_name("   ").await.unwrap_err();
        assert!(matches!(
            err,
            LookupError::Permanent {
                kind: PermanentKind::InvalidInput,
                ..
            }
        ));
    }
}
