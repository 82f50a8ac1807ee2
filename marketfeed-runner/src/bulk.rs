//! Bulk coordinator: resolve many keys of one data type concurrently.
//!
//! Keys already fresh in the cache are answered directly. Misses run through
//! the fallback orchestrator on a private rayon pool sized to the batch, and
//! their successes are written back with a single `put_bulk` once the batch
//! settles. A failed key never affects its siblings, and a batch deadline
//! bounds how long the caller waits.

use crate::progress::BulkProgress;
use marketfeed_core::cache::{CacheEntry, CacheStore, CacheWrite};
use marketfeed_core::config::{BulkSettings, ConfigError};
use marketfeed_core::registry::SourceSpec;
use marketfeed_core::{AdapterMap, FailureReason, FallbackOrchestrator, FetchResult, Origin, QueryKey};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source name reported for cache hits written without provenance.
pub const CACHE_SOURCE: &str = "cache";

/// Per-request options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Skip the cache read. Fresh successes are still written back.
    pub bypass_cache: bool,
}

impl FetchOptions {
    pub fn bypass_cache() -> Self {
        Self { bypass_cache: true }
    }
}

/// Counts for one batch. `total` is the number of distinct keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkSummary {
    pub total: usize,
    pub cache_hits: usize,
    /// Successes fetched from upstream.
    pub fetched: usize,
    /// Keys whose source chain was exhausted.
    pub failed: usize,
    /// Keys still in flight when the batch deadline passed.
    pub timed_out: usize,
}

impl BulkSummary {
    fn record(&mut self, result: &FetchResult) {
        match result {
            FetchResult::Success {
                origin: Origin::Cache,
                ..
            } => self.cache_hits += 1,
            FetchResult::Success { .. } => self.fetched += 1,
            FetchResult::Failure {
                reason: FailureReason::Timeout,
            } => self.timed_out += 1,
            FetchResult::Failure { .. } => self.failed += 1,
        }
    }
}

/// Result of [`BulkCoordinator::fetch_many`].
#[derive(Debug, Clone, PartialEq)]
pub struct BulkReport {
    /// One entry per distinct key.
    pub results: BTreeMap<QueryKey, FetchResult>,
    pub summary: BulkSummary,
}

impl BulkReport {
    pub fn get(&self, key: &QueryKey) -> Option<&FetchResult> {
        self.results.get(key)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn successes(&self) -> impl Iterator<Item = (&QueryKey, &FetchResult)> {
        self.results.iter().filter(|(_, r)| r.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&QueryKey, &FetchResult)> {
        self.results.iter().filter(|(_, r)| r.is_failure())
    }
}

/// Worker count for `misses` keys: one worker per `keys_per_worker` misses,
/// at least one, at most `max_workers`, never more than the misses themselves.
pub fn pool_size_for(misses: usize, settings: &BulkSettings) -> usize {
    if misses == 0 {
        return 0;
    }
    let per_worker = settings.keys_per_worker.max(1);
    misses
        .div_ceil(per_worker)
        .clamp(1, settings.max_workers.max(1))
        .min(misses)
}

/// A fresh cache entry as a fetch result, keeping its original timestamp.
pub fn cached_result(entry: CacheEntry) -> FetchResult {
    FetchResult::Success {
        value: entry.value,
        source_name: entry.source.unwrap_or_else(|| CACHE_SOURCE.to_string()),
        fetched_at: entry.timestamp,
        origin: Origin::Cache,
    }
}

/// Completion counter for one batch, forwarding each resolved key to the observer.
struct Tally<'a> {
    done: usize,
    total: usize,
    observer: &'a dyn BulkProgress,
}

impl Tally<'_> {
    fn complete(&mut self, key: &QueryKey, result: &FetchResult) {
        self.done += 1;
        self.observer.on_complete(key, self.done, self.total, result);
    }
}

/// Runs batches against a shared orchestrator and cache.
#[derive(Clone)]
pub struct BulkCoordinator {
    orchestrator: FallbackOrchestrator,
    cache: Arc<CacheStore>,
    settings: BulkSettings,
    batch_timeout: Duration,
}

impl BulkCoordinator {
    pub fn new(orchestrator: FallbackOrchestrator, cache: Arc<CacheStore>, settings: BulkSettings) -> Self {
        let batch_timeout = settings.batch_timeout();
        Self {
            orchestrator,
            cache,
            settings,
            batch_timeout,
        }
    }

    /// Override the batch deadline with sub-second precision.
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn settings(&self) -> &BulkSettings {
        &self.settings
    }

    pub fn batch_timeout(&self) -> Duration {
        self.batch_timeout
    }

    /// Resolve every key in `keys` for `data_type`.
    ///
    /// Returns `Err` only for an unknown data type. Duplicate keys (after
    /// normalization) are resolved once.
    pub fn fetch_many(
        &self,
        data_type: &str,
        adapters: &AdapterMap,
        keys: &[QueryKey],
        options: FetchOptions,
        progress: &dyn BulkProgress,
    ) -> Result<BulkReport, ConfigError> {
        let sources: Arc<[SourceSpec]> = self.orchestrator.registry().sources_for(data_type)?.into();
        let unique: BTreeSet<QueryKey> = keys.iter().cloned().collect();
        let total = unique.len();

        let mut results = BTreeMap::new();
        let mut summary = BulkSummary {
            total,
            ..BulkSummary::default()
        };
        let mut misses = Vec::new();
        let mut tally = Tally {
            done: 0,
            total,
            observer: progress,
        };

        for key in unique {
            let hit = if options.bypass_cache {
                None
            } else {
                self.cache.get_entry(data_type, &key)
            };
            match hit {
                Some(entry) => {
                    let result = cached_result(entry);
                    summary.record(&result);
                    tally.complete(&key, &result);
                    results.insert(key, result);
                }
                None => misses.push(key),
            }
        }

        if !misses.is_empty() {
            let fetched = self.fetch_misses(data_type, &sources, adapters, misses, &mut tally);
            let mut staged = Vec::new();
            for (key, result) in fetched {
                summary.record(&result);
                if let FetchResult::Success {
                    value, source_name, ..
                } = &result
                {
                    staged.push(
                        CacheWrite::new(data_type, key.clone(), value.clone())
                            .with_source(source_name.clone()),
                    );
                }
                results.insert(key, result);
            }
            if let Err(e) = self.cache.put_bulk(staged) {
                tracing::warn!(data_type, error = %e, "failed to persist batch results");
            }
        }

        tracing::debug!(
            data_type,
            total = summary.total,
            cache_hits = summary.cache_hits,
            fetched = summary.fetched,
            failed = summary.failed,
            timed_out = summary.timed_out,
            "bulk fetch finished"
        );
        progress.on_batch_complete(&summary);
        Ok(BulkReport { results, summary })
    }

    /// Fetch `misses` concurrently; keys without an answer by the deadline get `Timeout`.
    fn fetch_misses(
        &self,
        data_type: &str,
        sources: &Arc<[SourceSpec]>,
        adapters: &AdapterMap,
        misses: Vec<QueryKey>,
        tally: &mut Tally<'_>,
    ) -> Vec<(QueryKey, FetchResult)> {
        let deadline = Instant::now() + self.batch_timeout;
        let workers = pool_size_for(misses.len(), &self.settings);
        let mut fetched = Vec::with_capacity(misses.len());

        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("marketfeed-bulk-{i}"))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                tracing::warn!(error = %e, "worker pool unavailable, fetching sequentially");
                for key in misses {
                    let result = if Instant::now() >= deadline {
                        FetchResult::failure(FailureReason::Timeout)
                    } else {
                        self.orchestrator.run_chain(data_type, sources, adapters, &key)
                    };
                    tally.complete(&key, &result);
                    fetched.push((key, result));
                }
                return fetched;
            }
        };

        tracing::debug!(data_type, misses = misses.len(), workers, "dispatching batch");
        let (tx, rx) = mpsc::channel();
        let data_type_owned: Arc<str> = Arc::from(data_type);
        let mut pending: BTreeSet<QueryKey> = BTreeSet::new();
        for key in misses {
            pending.insert(key.clone());
            let tx = tx.clone();
            let orchestrator = self.orchestrator.clone();
            let sources = Arc::clone(sources);
            let adapters = adapters.clone();
            let data_type = Arc::clone(&data_type_owned);
            pool.spawn(move || {
                let result = orchestrator.run_chain(&data_type, &sources, &adapters, &key);
                // The receiver is gone if the batch already timed out.
                let _ = tx.send((key, result));
            });
        }
        drop(tx);

        let mut disconnected = false;
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok((key, result)) => {
                    pending.remove(&key);
                    tally.complete(&key, &result);
                    fetched.push((key, result));
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }

        if !pending.is_empty() {
            tracing::warn!(
                data_type,
                outstanding = pending.len(),
                timeout_ms = self.batch_timeout.as_millis() as u64,
                "batch deadline passed with keys still in flight"
            );
        }
        for key in pending {
            let reason = if disconnected {
                FailureReason::TransportError("worker exited without a result".to_string())
            } else {
                FailureReason::Timeout
            };
            let result = FetchResult::failure(reason);
            tally.complete(&key, &result);
            fetched.push((key, result));
        }
        fetched
    }
}
