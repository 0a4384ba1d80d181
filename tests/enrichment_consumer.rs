//! Enrichment queue consumer integration tests
//!
//! Drive `EnrichmentWorker` against the in-memory queue and cache with a
//! scripted external lookup.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use company_resolver::error::{LookupError, PermanentKind, TransientKind};
use company_resolver::external::ExponentialBackoff;
use company_resolver::normalize::normalize;
use company_resolver::types::NewQueueEntry;
use company_resolver::{
    BackflowWriter, CacheEntry, CacheKey, CacheSource, Candidate, CompanyDetail, CompanyResolver,
    ConflictPolicy, EnrichmentConfig, EnrichmentQueue, EnrichmentWorker, ExternalLookup,
    InMemoryCacheStore, InMemoryEnrichmentQueue, InputRecord, LookupType, QueueStatus,
    ResolutionSource, SourceTrustPolicy, WorkerSettings,
};

// =============================================================================
// Test Fakes
// =============================================================================

type Answer = Result<Vec<Candidate>, LookupError>;

/// Per-name queue of answers; the last answer repeats once the queue is down to one.
#[derive(Default)]
struct ScriptedLookup {
    answers: Mutex<HashMap<String, VecDeque<Answer>>>,
    fallback: Option<(String, f64)>,
    calls: AtomicUsize,
}

impl ScriptedLookup {
    fn script(self, name: &str, answers: Vec<Answer>) -> Self {
        self.answers
            .lock()
            .unwrap()
            .insert(normalize(name), answers.into_iter().collect());
        self
    }

    /// Every unscripted name matches `company_prefix` + normalized name.
    fn matching_everything(mut self, company_prefix: &str, score: f64) -> Self {
        self.fallback = Some((company_prefix.to_string(), score));
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExternalLookup for ScriptedLookup {
    async fn search_by_name(&self, name: &str) -> Result<Vec<Candidate>, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = normalize(name);
        let mut answers = self.answers.lock().unwrap();
        if let Some(queue) = answers.get_mut(&key) {
            if queue.len() > 1 {
                return queue.pop_front().unwrap();
            }
            if let Some(last) = queue.front() {
                return last.clone();
            }
        }
        match &self.fallback {
            Some((prefix, score)) => Ok(vec![candidate(&format!("{prefix}{key}"), name, *score)]),
            None => Ok(Vec::new()),
        }
    }

    async fn get_by_id(&self, _company_id: &str) -> Result<Option<CompanyDetail>, LookupError> {
        Ok(None)
    }
}

fn candidate(company_id: &str, name: &str, score: f64) -> Candidate {
    Candidate {
        company_id: company_id.to_string(),
        official_name: name.to_string(),
        unified_code: None,
        aliases: vec![],
        score,
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn settings(max_attempts: i32) -> WorkerSettings {
    WorkerSettings {
        batch_size: 10,
        max_attempts,
        poll_interval: Duration::from_millis(10),
        stale_after: Duration::from_secs(900),
        min_match_score: 0.9,
        retry_backoff: ExponentialBackoff::new(Duration::from_secs(30), Duration::from_secs(3600))
            .without_jitter(),
    }
}

struct Harness {
    worker: EnrichmentWorker,
    queue: Arc<InMemoryEnrichmentQueue>,
    cache: Arc<InMemoryCacheStore>,
}

fn harness(lookup: Arc<ScriptedLookup>, cache: Arc<InMemoryCacheStore>, max_attempts: i32) -> Harness {
    let queue = Arc::new(InMemoryEnrichmentQueue::new());
    let writer = Arc::new(BackflowWriter::new(
        cache.clone(),
        ConflictPolicy::new(SourceTrustPolicy::default()),
        "IN_",
    ));
    let worker = EnrichmentWorker::new(queue.clone(), lookup, writer, settings(max_attempts));
    Harness {
        worker,
        queue,
        cache,
    }
}

async fn enqueue(queue: &InMemoryEnrichmentQueue, names: &[&str]) {
    let entries: Vec<NewQueueEntry> = names
        .iter()
        .map(|name| NewQueueEntry {
            raw_name: name.to_string(),
            normalized_name: normalize(name),
            lookup_type: LookupType::CustomerName,
            temp_id: None,
        })
        .collect();
    queue.enqueue_batch(&entries).await.unwrap();
}

fn transient() -> Answer {
    Err(LookupError::transient(TransientKind::Timeout, "timed out"))
}

// =============================================================================
// Outcomes
// =============================================================================

#[tokio::test]
async fn test_match_backflows_and_marks_done() {
    let mut top = candidate("C_ACME", "Acme Group Ltd", 0.96);
    top.aliases = vec!["Acme Old Name".to_string()];
    let lookup = Arc::new(ScriptedLookup::default().script("acme group", vec![Ok(vec![top])]));
    let h = harness(lookup, Arc::new(InMemoryCacheStore::new()), 3);
    enqueue(&h.queue, &["Acme Group"]).await;

    let report = h.worker.process_batch().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.resolved, 1);

    let entry = &h.queue.find_by_name("ACMEGROUP")[0];
    assert_eq!(entry.status, QueueStatus::Done);
    assert_eq!(entry.resolved_company_id.as_deref(), Some("C_ACME"));

    for (lookup_type, key) in [
        (LookupType::CustomerName, "ACMEGROUP"),
        (LookupType::CustomerName, "ACMEGROUPLTD"),
        (LookupType::FormerName, "ACMEOLDNAME"),
    ] {
        let learned = h.cache.get(&CacheKey::new(lookup_type, key)).unwrap();
        assert_eq!(learned.company_id, "C_ACME");
        assert_eq!(learned.source, CacheSource::ExternalApi);
        assert_eq!(learned.confidence, 0.96);
    }
}

#[tokio::test]
async fn test_no_match_is_done_without_company() {
    let lookup = Arc::new(ScriptedLookup::default());
    let h = harness(lookup, Arc::new(InMemoryCacheStore::new()), 3);
    enqueue(&h.queue, &["Nobody Knows Co"]).await;

    let report = h.worker.process_batch().await.unwrap();
    assert_eq!(report.no_match, 1);

    let entry = &h.queue.all()[0];
    assert_eq!(entry.status, QueueStatus::Done);
    assert!(entry.resolved_company_id.is_none());
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn test_transient_failure_at_ceiling_moves_to_failed() {
    let lookup = Arc::new(ScriptedLookup::default().script("Flaky Co", vec![transient()]));
    let h = harness(lookup.clone(), Arc::new(InMemoryCacheStore::new()), 3);
    enqueue(&h.queue, &["Flaky Co"]).await;

    for expected_attempts in 1..=2 {
        let report = h.worker.process_batch().await.unwrap();
        assert_eq!(report.retried, 1);
        let entry = &h.queue.all()[0];
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.attempts, expected_attempts);
        assert!(entry.next_attempt_at > chrono::Utc::now());
        h.queue.make_all_due();
    }

    // attempts == ceiling - 1, fails again
    let report = h.worker.process_batch().await.unwrap();
    assert_eq!(report.failed, 1);
    let entry = &h.queue.all()[0];
    assert_eq!(entry.status, QueueStatus::Failed);
    assert_eq!(entry.attempts, 3);
    assert!(entry.last_error.as_deref().unwrap().contains("timed out"));

    // failed entries are not claimed again
    h.queue.make_all_due();
    assert_eq!(h.worker.process_batch().await.unwrap().claimed, 0);
    assert_eq!(lookup.calls(), 3);
}

#[tokio::test]
async fn test_backoff_defers_retry() {
    let lookup = Arc::new(ScriptedLookup::default().script("Slow Co", vec![transient()]));
    let h = harness(lookup, Arc::new(InMemoryCacheStore::new()), 5);
    enqueue(&h.queue, &["Slow Co"]).await;

    h.worker.process_batch().await.unwrap();
    // next attempt is 30s out
    assert_eq!(h.worker.process_batch().await.unwrap().claimed, 0);
}

#[tokio::test]
async fn test_transient_then_success() {
    let lookup = Arc::new(ScriptedLookup::default().script(
        "Recovering Co",
        vec![transient(), Ok(vec![candidate("C_REC", "Recovering Co", 0.99)])],
    ));
    let h = harness(lookup, Arc::new(InMemoryCacheStore::new()), 3);
    enqueue(&h.queue, &["Recovering Co"]).await;

    assert_eq!(h.worker.process_batch().await.unwrap().retried, 1);
    h.queue.make_all_due();
    assert_eq!(h.worker.process_batch().await.unwrap().resolved, 1);

    let entry = &h.queue.all()[0];
    assert_eq!(entry.status, QueueStatus::Done);
    assert_eq!(entry.attempts, 1);
}

#[tokio::test]
async fn test_permanent_failure_skips_retries() {
    let lookup = Arc::new(ScriptedLookup::default().script(
        "Forbidden Co",
        vec![Err(LookupError::permanent(PermanentKind::Unauthorized, "HTTP 401"))],
    ));
    let h = harness(lookup, Arc::new(InMemoryCacheStore::new()), 5);
    enqueue(&h.queue, &["Forbidden Co"]).await;

    let report = h.worker.process_batch().await.unwrap();
    assert_eq!(report.failed, 1);
    let entry = &h.queue.all()[0];
    assert_eq!(entry.status, QueueStatus::Failed);
    assert_eq!(entry.attempts, 1);
}

#[tokio::test]
async fn test_circuit_open_releases_without_attempt() {
    let lookup = Arc::new(ScriptedLookup::default().script(
        "Waiting Co",
        vec![Err(LookupError::transient(TransientKind::CircuitOpen, "open"))],
    ));
    let h = harness(lookup, Arc::new(InMemoryCacheStore::new()), 3);
    enqueue(&h.queue, &["Waiting Co"]).await;

    let report = h.worker.process_batch().await.unwrap();
    assert_eq!(report.released, 1);
    let entry = &h.queue.all()[0];
    assert_eq!(entry.status, QueueStatus::Pending);
    assert_eq!(entry.attempts, 0);
}

#[tokio::test]
async fn test_consumer_writes_respect_conflict_policy() {
    let cache = Arc::new(InMemoryCacheStore::with_entries(vec![CacheEntry::new(
        LookupType::CustomerName,
        "CONTESTEDCO",
        "C_MANUAL",
        CacheSource::Manual,
        1.0,
    )]));
    let lookup = Arc::new(ScriptedLookup::default().script(
        "Contested Co",
        vec![Ok(vec![candidate("C_EXTERNAL", "Contested Co", 0.93)])],
    ));
    let h = harness(lookup, cache, 3);
    enqueue(&h.queue, &["Contested Co"]).await;

    let report = h.worker.process_batch().await.unwrap();
    assert_eq!(report.resolved, 1);
    assert_eq!(report.backflow.kept_existing, 1);

    let stored = h
        .cache
        .get(&CacheKey::new(LookupType::CustomerName, "CONTESTEDCO"))
        .unwrap();
    assert_eq!(stored.company_id, "C_MANUAL");
    let log = h.cache.conflict_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].loser_company_id, "C_EXTERNAL");
}

#[tokio::test]
async fn test_cache_outage_during_backflow_retries_entry() {
    let lookup = Arc::new(ScriptedLookup::default().matching_everything("C_", 0.99));
    let cache = Arc::new(InMemoryCacheStore::new());
    let h = harness(lookup, cache.clone(), 3);
    enqueue(&h.queue, &["Outage Co"]).await;

    cache.set_unavailable(true);
    let report = h.worker.process_batch().await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(h.queue.all()[0].status, QueueStatus::Pending);

    cache.set_unavailable(false);
    h.queue.make_all_due();
    assert_eq!(h.worker.process_batch().await.unwrap().resolved, 1);
}

#[tokio::test]
async fn test_account_name_entry_converges_on_next_run() {
    let cache = Arc::new(InMemoryCacheStore::new());
    let lookup = Arc::new(ScriptedLookup::default().script(
        "Acme Pension Account",
        vec![Ok(vec![candidate("C_ACME", "Acme Holdings Ltd", 0.95)])],
    ));
    let h = harness(lookup, cache.clone(), 3);
    let config = EnrichmentConfig {
        salt: "integration-test-salt".to_string(),
        sync_budget: 0,
        ..EnrichmentConfig::default()
    };
    let resolver = CompanyResolver::new(&config, cache.clone(), h.queue.clone(), None).unwrap();
    let record = || InputRecord::new("1").with_account_name("Acme Pension Account");

    let first = resolver.resolve_batch(&[record()]).await.unwrap();
    assert_eq!(
        first.outcomes[0].resolution.as_ref().unwrap().source,
        ResolutionSource::Temp
    );
    assert_eq!(h.queue.all()[0].lookup_type, LookupType::AccountName);

    assert_eq!(h.worker.process_batch().await.unwrap().resolved, 1);
    let learned = cache
        .get(&CacheKey::new(LookupType::AccountName, "ACMEPENSIONACCOUNT"))
        .unwrap();
    assert_eq!(learned.company_id, "C_ACME");

    let second = resolver.resolve_batch(&[record()]).await.unwrap();
    let resolution = second.outcomes[0].resolution.clone().unwrap();
    assert_eq!(resolution.company_id, "C_ACME");
    assert_eq!(resolution.source, ResolutionSource::Cache);
    assert_eq!(second.report.enqueued, 0);
    assert_eq!(h.queue.all().len(), 1);
}

// =============================================================================
// Worker pool
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_processes_each_entry_once() {
    let lookup = Arc::new(ScriptedLookup::default().matching_everything("C_", 0.99));
    let h = harness(lookup.clone(), Arc::new(InMemoryCacheStore::new()), 3);

    let names: Vec<String> = (0..40).map(|i| format!("Pool Company {i}")).collect();
    let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    enqueue(&h.queue, &refs).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = h.worker.spawn_workers(4, shutdown_rx);
    assert_eq!(handles.len(), 4);

    let mut done = 0;
    for _ in 0..200 {
        done = h.queue.stats().await.unwrap().done;
        if done == 40 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(done, 40);
    assert_eq!(lookup.calls(), 40);
    assert_eq!(h.cache.len(), 40);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let lookup = Arc::new(ScriptedLookup::default());
    let h = harness(lookup, Arc::new(InMemoryCacheStore::new()), 3);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = h.worker.clone();
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
}
