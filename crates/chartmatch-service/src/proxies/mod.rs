//! The proxy pool: finding a working egress path to the chart source.
//!
//! The chart source is only reliably reachable through third-party proxies of unknown
//! and rapidly changing quality. [`ProxyPool::acquire`] hands out an address that has
//! just been demonstrated to work by a real request, in three phases:
//!
//! 1. Previously validated addresses from the proxy cache are retried first, in
//!    ascending order of their recorded latency. They are the most likely to still
//!    work and spend no discovery budget.
//! 2. If none of them validate, fresh candidates are gathered from all configured
//!    sources concurrently. A failing source contributes zero candidates instead of
//!    aborting the gather.
//! 3. Fresh candidates are validated across a bounded worker pool; the first success
//!    wins and the remaining in-flight validations are abandoned, so total latency is
//!    bounded by the fastest success rather than the sum of all attempts.
//!
//! What "working" means is up to the chart-fetch collaborator, which supplies the
//! [`ProxyValidator`]. Each validation attempt is bounded by the configured split
//! connect/read timeout so a single hung candidate cannot stall the pool.

use std::collections::HashSet;
use std::future::Future;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};

use chartmatch_sources::ProxySourceConfig;

use crate::caching::{CacheError, FileCache};
use crate::config::Config;
use crate::utils::http::{ValidationTimeouts, create_client};

mod sources;

pub use sources::SourceError;

/// File name of the proxy cache inside the configured cache directory.
const PROXY_CACHE_FILE: &str = "proxies.json";

/// Failure to find any working egress path.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Every candidate, cached and fresh, failed validation.
    #[error("no working proxy among {candidates} candidates")]
    NoProxyAvailable {
        /// Number of candidates that were tried before giving up.
        candidates: usize,
    },
}

/// A predicate performing a real request through a candidate proxy.
///
/// Supplied by the chart-fetch collaborator, since only it knows what "working" means
/// for its target. Implementations should bring their own HTTP client; the pool takes
/// care of timeouts and retries around each call.
pub trait ProxyValidator: Send + Sync {
    /// Performs a real request through `address` and reports whether it worked.
    fn validate(&self, address: &str) -> impl Future<Output = bool> + Send;
}

/// Cached record of a previously validated proxy address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRecord {
    /// Measured validation latency in milliseconds.
    pub latency_ms: u64,
}

/// A pool of candidate proxies with a persistent known-good cache.
#[derive(Debug)]
pub struct ProxyPool {
    cache: FileCache<ProxyRecord>,
    sources: Vec<ProxySourceConfig>,
    client: reqwest::Client,
    workers: usize,
    retries: usize,
    cache_ttl: Duration,
    attempt_timeout: Duration,
}

impl ProxyPool {
    /// Creates a pool from the service configuration.
    pub fn new(config: &Config) -> Self {
        let timeouts = ValidationTimeouts::from_config(config);
        Self {
            cache: FileCache::open(
                config.cache_path(PROXY_CACHE_FILE),
                config.caches.write_batch_size,
            ),
            sources: config.proxy.sources.clone(),
            client: create_client(&timeouts),
            workers: config.proxy.workers,
            retries: config.proxy.validation_retries,
            cache_ttl: config.caches.proxy_ttl,
            attempt_timeout: timeouts.total(),
        }
    }

    /// Returns a proxy address demonstrated to satisfy `validator`.
    ///
    /// Cached known-good addresses are tried before any fresh discovery happens; a
    /// cached address that fails validation is evicted. The winning address is written
    /// back to the proxy cache with the configured TTL.
    pub async fn acquire<V: ProxyValidator>(&self, validator: &V) -> Result<String, ProxyError> {
        let mut attempted = 0;

        let mut cached = self.cache.valid_rows();
        cached.sort_by_key(|(_, record)| record.latency_ms);
        let cached_addresses: HashSet<String> =
            cached.iter().map(|(address, _)| address.clone()).collect();

        for (address, _) in cached {
            attempted += 1;
            match self.try_candidate(validator, &address).await {
                Some(latency) => {
                    tracing::debug!(%address, latency_ms = latency.as_millis() as u64, "cached proxy still works");
                    self.record_success(&address, latency);
                    return Ok(address);
                }
                None => self.cache.delete(&address),
            }
        }

        let fresh: Vec<String> = self
            .gather_candidates()
            .await
            .into_iter()
            .filter(|address| !cached_addresses.contains(address))
            .collect();
        attempted += fresh.len();

        if let Some((address, latency)) = self.race_fresh(validator, fresh).await {
            tracing::info!(%address, latency_ms = latency.as_millis() as u64, "found working proxy");
            self.record_success(&address, latency);
            return Ok(address);
        }

        Err(ProxyError::NoProxyAvailable {
            candidates: attempted,
        })
    }

    /// Forces the proxy cache onto disk. Call once on shutdown.
    pub fn flush(&self) -> Result<(), CacheError> {
        self.cache.flush()
    }

    /// Gathers fresh candidates from all sources concurrently, deduplicated,
    /// tolerating partial source failure.
    async fn gather_candidates(&self) -> Vec<String> {
        let fetches = self.sources.iter().map(|source| async move {
            let result = sources::fetch_candidates(&self.client, source).await;
            (source, result)
        });

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for (source, result) in futures::future::join_all(fetches).await {
            match result {
                Ok(addresses) => {
                    tracing::debug!(source = %source.id(), count = addresses.len(), "fetched proxy candidates");
                    for address in addresses {
                        if seen.insert(address.clone()) {
                            candidates.push(address);
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(source = %source.id(), %error, "proxy source failed, continuing without it");
                }
            }
        }
        candidates
    }

    /// Validates `candidates` across the worker pool, returning the first success.
    async fn race_fresh<V: ProxyValidator>(
        &self,
        validator: &V,
        candidates: Vec<String>,
    ) -> Option<(String, Duration)> {
        if candidates.is_empty() {
            return None;
        }
        tracing::debug!(
            candidates = candidates.len(),
            workers = self.workers,
            "racing fresh proxy candidates"
        );

        let mut validations = stream::iter(candidates)
            .map(|address| async move {
                let outcome = self.try_candidate(validator, &address).await;
                (address, outcome)
            })
            .buffer_unordered(self.workers.max(1));

        while let Some((address, outcome)) = validations.next().await {
            if let Some(latency) = outcome {
                // First success wins. Returning drops the stream, which abandons the
                // in-flight validations; their results no longer matter.
                return Some((address, latency));
            }
        }
        None
    }

    /// Runs the validator against one candidate, bounded by the per-attempt timeout,
    /// with the configured number of retries. Timeouts count as failures.
    async fn try_candidate<V: ProxyValidator>(
        &self,
        validator: &V,
        address: &str,
    ) -> Option<Duration> {
        for attempt in 1..=self.retries.max(1) {
            let start = Instant::now();
            match tokio::time::timeout(self.attempt_timeout, validator.validate(address)).await {
                Ok(true) => return Some(start.elapsed()),
                Ok(false) => tracing::debug!(address, attempt, "proxy validation failed"),
                Err(_) => tracing::debug!(address, attempt, "proxy validation timed out"),
            }
        }
        None
    }

    fn record_success(&self, address: &str, latency: Duration) {
        self.cache.put(
            address,
            ProxyRecord {
                latency_ms: latency.as_millis() as u64,
            },
            self.cache_ttl,
        );
        if let Err(error) = self.cache.flush() {
            tracing::warn!(%error, "failed to persist proxy cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chartmatch_test as testkit;

    use super::*;

    struct FakeValidator {
        good: HashSet<&'static str>,
        delays: HashMap<&'static str, Duration>,
        calls: AtomicUsize,
    }

    impl FakeValidator {
        fn new(good: &[&'static str]) -> Self {
            Self {
                good: good.iter().copied().collect(),
                delays: HashMap::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, address: &'static str, delay: Duration) -> Self {
            self.delays.insert(address, delay);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ProxyValidator for FakeValidator {
        async fn validate(&self, address: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delays.get(address) {
                tokio::time::sleep(*delay).await;
            }
            self.good.contains(address)
        }
    }

    fn pool(cache_dir: &testkit::TempDir) -> ProxyPool {
        let config = Config {
            cache_dir: Some(cache_dir.path().to_owned()),
            ..Config::default()
        };
        ProxyPool::new(&config)
    }

    #[tokio::test]
    async fn test_acquire_prefers_cached() {
        testkit::setup();
        let cache_dir = testkit::tempdir();
        let pool = pool(&cache_dir);
        pool.cache.put(
            "10.0.0.1:8080",
            ProxyRecord { latency_ms: 120 },
            Duration::from_secs(3600),
        );

        let validator = FakeValidator::new(&["10.0.0.1:8080"]);
        let address = pool.acquire(&validator).await.unwrap();

        assert_eq!(address, "10.0.0.1:8080");
        assert_eq!(validator.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_cached_address_is_evicted() {
        testkit::setup();
        let cache_dir = testkit::tempdir();
        let pool = pool(&cache_dir);
        pool.cache.put(
            "10.0.0.1:8080",
            ProxyRecord { latency_ms: 120 },
            Duration::from_secs(3600),
        );

        let validator = FakeValidator::new(&[]);
        let result = pool.acquire(&validator).await;

        assert!(matches!(
            result,
            Err(ProxyError::NoProxyAvailable { candidates: 1 })
        ));
        assert!(pool.cache.get("10.0.0.1:8080").is_none());
    }

    #[tokio::test]
    async fn test_race_returns_first_success() {
        testkit::setup();
        let cache_dir = testkit::tempdir();
        let pool = pool(&cache_dir);

        // A fails, B succeeds quickly, C would succeed but is very slow. The race
        // must settle on B without waiting for C.
        let validator = FakeValidator::new(&["b:80", "c:80"])
            .with_delay("b:80", Duration::from_millis(10))
            .with_delay("c:80", Duration::from_secs(5));

        let start = Instant::now();
        let (address, _latency) = pool
            .race_fresh(
                &validator,
                vec!["a:80".into(), "b:80".into(), "c:80".into()],
            )
            .await
            .unwrap();

        assert_eq!(address, "b:80");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_race_exhaustion_tries_everything() {
        testkit::setup();
        let cache_dir = testkit::tempdir();
        let pool = pool(&cache_dir);

        let validator = FakeValidator::new(&[]);
        let result = pool
            .race_fresh(
                &validator,
                vec!["a:80".into(), "b:80".into(), "c:80".into()],
            )
            .await;

        assert!(result.is_none());
        assert_eq!(validator.calls(), 3);
    }

    #[tokio::test]
    async fn test_hung_candidate_times_out() {
        testkit::setup();
        let cache_dir = testkit::tempdir();
        let config = Config {
            cache_dir: Some(cache_dir.path().to_owned()),
            connect_timeout: Duration::from_millis(25),
            read_timeout: Duration::from_millis(25),
            ..Config::default()
        };
        let pool = ProxyPool::new(&config);

        let validator =
            FakeValidator::new(&["hung:80"]).with_delay("hung:80", Duration::from_secs(60));
        let result = pool.race_fresh(&validator, vec!["hung:80".into()]).await;

        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_validation_retries_are_configurable() {
        testkit::setup();
        let cache_dir = testkit::tempdir();
        let mut config = Config {
            cache_dir: Some(cache_dir.path().to_owned()),
            ..Config::default()
        };
        config.proxy.validation_retries = 3;
        let pool = ProxyPool::new(&config);

        let validator = FakeValidator::new(&[]);
        assert!(pool.try_candidate(&validator, "a:80").await.is_none());
        assert_eq!(validator.calls(), 3);
    }

    #[tokio::test]
    async fn test_winner_is_cached_and_persisted() {
        testkit::setup();
        let cache_dir = testkit::tempdir();
        let pool = pool(&cache_dir);

        pool.record_success("b:80", Duration::from_millis(42));

        assert!(pool.cache.get("b:80").is_some());
        // record_success flushes, so a fresh pool over the same directory sees it
        let reopened = {
            let config = Config {
                cache_dir: Some(cache_dir.path().to_owned()),
                ..Config::default()
            };
            ProxyPool::new(&config)
        };
        assert_eq!(reopened.cache.get("b:80").unwrap().latency_ms, 42);
    }

    #[tokio::test]
    async fn test_empty_pool_exhausts_immediately() {
        testkit::setup();
        let cache_dir = testkit::tempdir();
        let pool = pool(&cache_dir);

        let validator = FakeValidator::new(&[]);
        let result = pool.acquire(&validator).await;

        assert!(matches!(
            result,
            Err(ProxyError::NoProxyAvailable { candidates: 0 })
        ));
        assert_eq!(validator.calls(), 0);
    }
}
