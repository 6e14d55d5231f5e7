//! Resolving chart entries against the catalog.
//!
//! The resolver turns a ranked list of [`ChartEntry`] values into [`ResolvedEntry`]
//! outcomes in the same order, fanning the catalog searches out over a bounded worker
//! pool. Completion order inside the pool is arbitrary; the output order is not.
//!
//! Search outcomes are memoized twice over:
//!
//! - A persistent TTL cache keyed by the entry's canonicalized signature remembers
//!   resolutions across runs. A confident "no match" is an outcome too and is cached
//!   just like a hit, so a track missing from the catalog is not searched again on
//!   every crawl.
//! - Within a run, concurrent requests for the same signature coalesce onto a single
//!   in-flight search through a shared channel, so at most one network call per
//!   signature is ever outstanding.
//!
//! Transport failures are neither cached nor coalesced into future requests: the
//! affected entry comes back unresolved and the next run retries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::Shared;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::caching::{CacheError, CacheStats, FileCache};
use crate::config::Config;
use crate::matching;
use crate::types::{ChartEntry, MatchCandidate, ResolvedEntry, ScoredMatch};
use crate::utils::http::ValidationTimeouts;

/// File name of the search cache inside the configured cache directory.
const SEARCH_CACHE_FILE: &str = "searches.json";

/// Errors a catalog search can fail with.
///
/// Cloneable because one failure may be delivered to every request coalesced onto the
/// failed search.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    /// The search did not complete within the per-search ceiling.
    #[error("catalog search timed out after {0:?}")]
    Timeout(Duration),
    /// The catalog API reported a failure.
    #[error("catalog API error: {0}")]
    Api(String),
}

/// The catalog search seam.
///
/// Implemented by the catalog API client collaborator. Implementations only return
/// raw candidates; scoring, thresholding and caching all happen here.
pub trait CatalogSearch: Send + Sync + 'static {
    /// Searches the catalog for tracks matching `title` and `artist`.
    fn search(
        &self,
        title: &str,
        artist: &str,
    ) -> impl Future<Output = Result<Vec<MatchCandidate>, SearchError>> + Send;
}

type SearchOutcome = Result<Option<ScoredMatch>, SearchError>;
type SearchChannel = Shared<oneshot::Receiver<SearchOutcome>>;

/// Order-preserving concurrent resolver of chart entries to catalog matches.
pub struct CatalogResolver<S> {
    searcher: Arc<S>,
    cache: Arc<FileCache<Option<ScoredMatch>>>,
    current_searches: Arc<Mutex<HashMap<String, SearchChannel>>>,
    workers: usize,
    min_confidence: f64,
    search_timeout: Duration,
    cache_ttl: Duration,
}

impl<S: CatalogSearch> CatalogResolver<S> {
    /// Creates a resolver around `searcher` from the service configuration.
    pub fn new(searcher: S, config: &Config) -> Self {
        Self {
            searcher: Arc::new(searcher),
            cache: Arc::new(FileCache::open(
                config.cache_path(SEARCH_CACHE_FILE),
                config.caches.write_batch_size,
            )),
            current_searches: Arc::new(Mutex::new(HashMap::new())),
            workers: config.resolver.workers,
            min_confidence: config.resolver.min_confidence,
            search_timeout: ValidationTimeouts::from_config(config).total(),
            cache_ttl: config.caches.search_ttl,
        }
    }

    /// Resolves all `entries`, returning outcomes in the input order.
    pub async fn resolve(&self, entries: Vec<ChartEntry>) -> Vec<ResolvedEntry> {
        let total = entries.len();

        let mut resolutions: Vec<(usize, ResolvedEntry)> =
            futures::stream::iter(entries.into_iter().enumerate())
                .map(|(index, entry)| async move { (index, self.resolve_entry(entry).await) })
                .buffer_unordered(self.workers.max(1))
                .collect()
                .await;

        // Workers complete in arbitrary order; the chart order is part of the result.
        resolutions.sort_by_key(|(index, _)| *index);

        let matched = resolutions
            .iter()
            .filter(|(_, resolution)| resolution.best_match.is_some())
            .count();
        tracing::info!(total, matched, "chart resolution finished");

        resolutions
            .into_iter()
            .map(|(_, resolution)| resolution)
            .collect()
    }

    /// Resolves a single chart entry.
    ///
    /// A failed search yields an unresolved entry rather than an error; the failure is
    /// logged with the entry's chart context and nothing is cached for it.
    pub async fn resolve_entry(&self, entry: ChartEntry) -> ResolvedEntry {
        let key = matching::entry_signature(&entry);

        if let Some(best_match) = self.cache.get(&key) {
            tracing::trace!(title = %entry.title, "search cache hit");
            return ResolvedEntry { entry, best_match };
        }

        match self.coalesced_search(&key, &entry).await {
            Ok(best_match) => ResolvedEntry { entry, best_match },
            Err(error) => {
                tracing::warn!(
                    rank = entry.rank,
                    title = %entry.title,
                    artist = %entry.artist,
                    %error,
                    "catalog search failed, leaving entry unresolved"
                );
                ResolvedEntry {
                    entry,
                    best_match: None,
                }
            }
        }
    }

    /// Forces the search cache onto disk. Call once on shutdown.
    pub fn flush(&self) -> Result<(), CacheError> {
        self.cache.flush()
    }

    /// Search cache row counts, for logging.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Attaches to the in-flight search for `key`, spawning it if there is none.
    ///
    /// The spawned task removes itself from the map before it completes its channel,
    /// so a new request arriving after completion starts a fresh search instead of
    /// attaching to a finished one. Successful outcomes are written to the cache by
    /// the task itself; errors are delivered to the waiters only.
    async fn coalesced_search(&self, key: &str, entry: &ChartEntry) -> SearchOutcome {
        let channel = {
            let mut current_searches = self.current_searches.lock();
            if let Some(channel) = current_searches.get(key) {
                tracing::trace!(title = %entry.title, "attaching to in-flight search");
                channel.clone()
            } else {
                let (sender, receiver) = oneshot::channel();
                let channel = receiver.shared();
                current_searches.insert(key.to_owned(), channel.clone());

                let searcher = Arc::clone(&self.searcher);
                let cache = Arc::clone(&self.cache);
                let searches = Arc::clone(&self.current_searches);
                let key = key.to_owned();
                let entry = entry.clone();
                let min_confidence = self.min_confidence;
                let timeout = self.search_timeout;
                let cache_ttl = self.cache_ttl;

                tokio::spawn(async move {
                    let outcome = run_search(&*searcher, &entry, min_confidence, timeout).await;

                    if let Ok(best_match) = &outcome {
                        cache.put(key.clone(), best_match.clone(), cache_ttl);
                    }

                    searches.lock().remove(&key);
                    sender.send(outcome).ok();
                });

                channel
            }
        };

        match channel.await {
            Ok(outcome) => outcome,
            // The task never drops the sender before sending unless the runtime is
            // shutting down underneath us.
            Err(_canceled) => Err(SearchError::Api("search task was dropped".into())),
        }
    }
}

/// Performs one catalog search and picks the best-scoring candidate.
///
/// Returns `Ok(None)` both for an empty result and for a best candidate below the
/// confidence threshold; both are cacheable outcomes.
async fn run_search<S: CatalogSearch>(
    searcher: &S,
    entry: &ChartEntry,
    min_confidence: f64,
    timeout: Duration,
) -> SearchOutcome {
    let search = searcher.search(&entry.title, &entry.artist);
    let candidates = match tokio::time::timeout(timeout, search).await {
        Ok(result) => result?,
        Err(_) => return Err(SearchError::Timeout(timeout)),
    };

    let best = candidates
        .into_iter()
        .map(|candidate| {
            let score = matching::score(entry, &candidate);
            ScoredMatch { candidate, score }
        })
        .max_by(|a, b| a.score.total_cmp(&b.score));

    match best {
        Some(scored) if scored.score >= min_confidence => Ok(Some(scored)),
        Some(scored) => {
            tracing::debug!(
                title = %entry.title,
                score = scored.score,
                catalog_id = %scored.candidate.catalog_id,
                "best candidate below confidence threshold"
            );
            Ok(None)
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chartmatch_test as testkit;

    use super::*;

    struct FakeCatalog {
        tracks: HashMap<String, Vec<MatchCandidate>>,
        delays: HashMap<String, Duration>,
        fail_next: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl FakeCatalog {
        fn new() -> Self {
            Self {
                tracks: HashMap::new(),
                delays: HashMap::new(),
                fail_next: Arc::new(AtomicUsize::new(0)),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn with_track(mut self, title: &str, candidate: MatchCandidate) -> Self {
            self.tracks.entry(title.to_owned()).or_default().push(candidate);
            self
        }

        fn with_delay(mut self, title: &str, delay: Duration) -> Self {
            self.delays.insert(title.to_owned(), delay);
            self
        }

        fn failing_next(self, failures: usize) -> Self {
            self.fail_next.store(failures, Ordering::SeqCst);
            self
        }

        fn call_counter(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.calls)
        }
    }

    impl CatalogSearch for FakeCatalog {
        async fn search(
            &self,
            title: &str,
            _artist: &str,
        ) -> Result<Vec<MatchCandidate>, SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delays.get(title) {
                tokio::time::sleep(*delay).await;
            }
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err(SearchError::Api("upstream 500".into()));
            }
            Ok(self.tracks.get(title).cloned().unwrap_or_default())
        }
    }

    fn entry(title: &str, artist: &str, duration_secs: u32, rank: u32) -> ChartEntry {
        ChartEntry {
            title: title.to_owned(),
            artist: artist.to_owned(),
            duration_secs,
            rank,
        }
    }

    fn candidate(catalog_id: &str, title: &str, artist: &str, duration_secs: u32) -> MatchCandidate {
        MatchCandidate {
            catalog_id: catalog_id.to_owned(),
            title: title.to_owned(),
            artist: artist.to_owned(),
            duration_secs,
            popularity: 0.5,
        }
    }

    fn config(cache_dir: &testkit::TempDir) -> Config {
        Config {
            cache_dir: Some(cache_dir.path().to_owned()),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_preserves_chart_order() {
        testkit::setup();
        let cache_dir = testkit::tempdir();

        // the middle entry finishes last, the output order must not care
        let catalog = FakeCatalog::new()
            .with_track("Alpha", candidate("catalog:track:a", "Alpha", "Ann", 200))
            .with_track("Beta", candidate("catalog:track:b", "Beta", "Bob", 210))
            .with_track("Gamma", candidate("catalog:track:c", "Gamma", "Cyd", 220))
            .with_delay("Beta", Duration::from_millis(100));
        let resolver = CatalogResolver::new(catalog, &config(&cache_dir));

        let resolved = resolver
            .resolve(vec![
                entry("Alpha", "Ann", 200, 1),
                entry("Beta", "Bob", 210, 2),
                entry("Gamma", "Cyd", 220, 3),
            ])
            .await;

        let ranks: Vec<u32> = resolved.iter().map(|r| r.entry.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        let ids: Vec<&str> = resolved
            .iter()
            .map(|r| r.best_match.as_ref().unwrap().candidate.catalog_id.as_str())
            .collect();
        assert_eq!(ids, vec!["catalog:track:a", "catalog:track:b", "catalog:track:c"]);
    }

    #[tokio::test]
    async fn test_repeat_resolution_hits_cache() {
        testkit::setup();
        let cache_dir = testkit::tempdir();
        let catalog = FakeCatalog::new()
            .with_track("Alpha", candidate("catalog:track:a", "Alpha", "Ann", 200));
        let calls = catalog.call_counter();
        let resolver = CatalogResolver::new(catalog, &config(&cache_dir));

        let first = resolver.resolve_entry(entry("Alpha", "Ann", 200, 1)).await;
        let second = resolver.resolve_entry(entry("Alpha", "Ann", 200, 1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.best_match, second.best_match);
        assert!(first.best_match.is_some());
    }

    #[tokio::test]
    async fn test_no_match_outcome_is_cached() {
        testkit::setup();
        let cache_dir = testkit::tempdir();
        let catalog = FakeCatalog::new();
        let calls = catalog.call_counter();
        let resolver = CatalogResolver::new(catalog, &config(&cache_dir));

        let unknown = entry("Unknown Song", "Unknown Artist", 123, 7);
        let first = resolver.resolve_entry(unknown.clone()).await;
        let second = resolver.resolve_entry(unknown).await;

        assert_eq!(first.best_match, None);
        assert_eq!(second.best_match, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no-match must be cached too");
    }

    #[tokio::test]
    async fn test_low_confidence_candidate_is_no_match() {
        testkit::setup();
        let cache_dir = testkit::tempdir();
        let catalog = FakeCatalog::new().with_track(
            "Flowers",
            candidate("catalog:track:x", "Completely Different Song", "Somebody Else", 400),
        );
        let resolver = CatalogResolver::new(catalog, &config(&cache_dir));

        let resolved = resolver.resolve_entry(entry("Flowers", "Miley Cyrus", 200, 1)).await;
        assert_eq!(resolved.best_match, None);
    }

    #[tokio::test]
    async fn test_search_failure_is_not_cached() {
        testkit::setup();
        let cache_dir = testkit::tempdir();
        let catalog = FakeCatalog::new()
            .with_track("Alpha", candidate("catalog:track:a", "Alpha", "Ann", 200))
            .failing_next(1);
        let calls = catalog.call_counter();
        let resolver = CatalogResolver::new(catalog, &config(&cache_dir));

        let failed = resolver.resolve_entry(entry("Alpha", "Ann", 200, 1)).await;
        assert_eq!(failed.best_match, None);

        // the failure left no cache row, so this run searches again and succeeds
        let retried = resolver.resolve_entry(entry("Alpha", "Ann", 200, 1)).await;
        assert!(retried.best_match.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slow_search_times_out_unresolved() {
        testkit::setup();
        let cache_dir = testkit::tempdir();
        let catalog = FakeCatalog::new()
            .with_track("Alpha", candidate("catalog:track:a", "Alpha", "Ann", 200))
            .with_delay("Alpha", Duration::from_secs(60));
        let calls = catalog.call_counter();

        let mut config = config(&cache_dir);
        config.connect_timeout = Duration::from_millis(25);
        config.read_timeout = Duration::from_millis(25);
        let resolver = CatalogResolver::new(catalog, &config);

        let resolved = resolver.resolve_entry(entry("Alpha", "Ann", 200, 1)).await;
        assert_eq!(resolved.best_match, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce() {
        testkit::setup();
        let cache_dir = testkit::tempdir();
        let catalog = FakeCatalog::new()
            .with_track("Alpha", candidate("catalog:track:a", "Alpha", "Ann", 200))
            .with_delay("Alpha", Duration::from_millis(50));
        let calls = catalog.call_counter();
        let resolver = CatalogResolver::new(catalog, &config(&cache_dir));

        let (first, second) = tokio::join!(
            resolver.resolve_entry(entry("Alpha", "Ann", 200, 1)),
            resolver.resolve_entry(entry("Alpha", "Ann", 200, 1)),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1, "concurrent identical searches must coalesce");
        assert_eq!(first.best_match, second.best_match);
        assert!(first.best_match.is_some());
    }

    #[tokio::test]
    async fn test_scrambled_entries_share_a_cache_row() {
        testkit::setup();
        let cache_dir = testkit::tempdir();
        let catalog = FakeCatalog::new()
            .with_track("Halo", candidate("catalog:track:h", "Halo", "Beyonce", 261));
        let calls = catalog.call_counter();
        let resolver = CatalogResolver::new(catalog, &config(&cache_dir));

        resolver.resolve_entry(entry("Halo", "Beyonce", 261, 1)).await;
        let scrambled = resolver.resolve_entry(entry("HALO!", "Beyoncé", 261, 1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(scrambled.best_match.is_some());
    }

    #[tokio::test]
    async fn test_resolutions_survive_restart() {
        testkit::setup();
        let cache_dir = testkit::tempdir();

        {
            let catalog = FakeCatalog::new()
                .with_track("Alpha", candidate("catalog:track:a", "Alpha", "Ann", 200));
            let resolver = CatalogResolver::new(catalog, &config(&cache_dir));
            resolver.resolve_entry(entry("Alpha", "Ann", 200, 1)).await;
            resolver.flush().unwrap();
        }

        // a fresh resolver over the same cache directory answers without searching
        let catalog = FakeCatalog::new();
        let calls = catalog.call_counter();
        let resolver = CatalogResolver::new(catalog, &config(&cache_dir));
        let resolved = resolver.resolve_entry(entry("Alpha", "Ann", 200, 1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            resolved.best_match.unwrap().candidate.catalog_id,
            "catalog:track:a"
        );
    }

    #[tokio::test]
    async fn test_ties_break_deterministically() {
        testkit::setup();
        let cache_dir = testkit::tempdir();
        // two candidates with identical text and duration score identically;
        // resolution must still settle on exactly one of them
        let catalog = FakeCatalog::new()
            .with_track("Alpha", candidate("catalog:track:a1", "Alpha", "Ann", 200))
            .with_track("Alpha", candidate("catalog:track:a2", "Alpha", "Ann", 200));
        let resolver = CatalogResolver::new(catalog, &config(&cache_dir));

        let resolved = resolver.resolve_entry(entry("Alpha", "Ann", 200, 1)).await;
        let best = resolved.best_match.unwrap();
        let winners: HashSet<&str> = ["catalog:track:a1", "catalog:track:a2"].into();
        assert!(winners.contains(best.candidate.catalog_id.as_str()));
    }
}
