//! `MarketFeed`: the cache-first entry point used by display layers.

use crate::bulk::{BulkCoordinator, BulkReport, FetchOptions};
use crate::progress::{BulkProgress, NoProgress};
use marketfeed_core::cache::{CacheError, CacheStats, CacheStore};
use marketfeed_core::config::{ConfigError, FeedConfig};
use marketfeed_core::{
    AdapterMap, Clock, FailureReason, FallbackOrchestrator, FetchResult, QueryKey, SystemClock,
};
use std::sync::Arc;

/// Owns the orchestrator, the shared cache and the bulk coordinator.
///
/// Build one at startup and share it; every method takes `&self`.
#[derive(Clone)]
pub struct MarketFeed {
    orchestrator: FallbackOrchestrator,
    cache: Arc<CacheStore>,
    bulk: BulkCoordinator,
}

impl MarketFeed {
    pub fn new(orchestrator: FallbackOrchestrator, cache: Arc<CacheStore>, bulk: BulkCoordinator) -> Self {
        Self {
            orchestrator,
            cache,
            bulk,
        }
    }

    /// Build everything from a config. The cache lives in memory when `[cache].path` is unset.
    pub fn from_config(config: &FeedConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        let orchestrator = FallbackOrchestrator::from_config(config, Arc::clone(&clock))?;
        let ttl = config.cache.ttl_table();
        let cache = Arc::new(match &config.cache.path {
            Some(path) => CacheStore::open(path, ttl, clock),
            None => CacheStore::in_memory(ttl, clock),
        });
        let bulk = BulkCoordinator::new(orchestrator.clone(), Arc::clone(&cache), config.bulk.clone());
        Ok(Self::new(orchestrator, cache, bulk))
    }

    /// Builtin source table on the wall clock.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_config(&FeedConfig::builtin(), Arc::new(SystemClock))
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn orchestrator(&self) -> &FallbackOrchestrator {
        &self.orchestrator
    }

    pub fn bulk(&self) -> &BulkCoordinator {
        &self.bulk
    }

    /// Resolve one key: fresh cache entry first, otherwise the source chain
    /// under the batch deadline. Successes from upstream are written back.
    pub fn fetch(
        &self,
        data_type: &str,
        adapters: &AdapterMap,
        key: &QueryKey,
        options: FetchOptions,
    ) -> Result<FetchResult, ConfigError> {
        let mut report =
            self.bulk
                .fetch_many(data_type, adapters, std::slice::from_ref(key), options, &NoProgress)?;
        Ok(report.results.remove(key).unwrap_or_else(|| {
            FetchResult::failure(FailureReason::TransportError(format!("no result for '{key}'")))
        }))
    }

    /// Resolve many keys concurrently.
    pub fn fetch_many(
        &self,
        data_type: &str,
        adapters: &AdapterMap,
        keys: &[QueryKey],
        options: FetchOptions,
    ) -> Result<BulkReport, ConfigError> {
        self.bulk.fetch_many(data_type, adapters, keys, options, &NoProgress)
    }

    pub fn fetch_many_with_progress(
        &self,
        data_type: &str,
        adapters: &AdapterMap,
        keys: &[QueryKey],
        options: FetchOptions,
        progress: &dyn BulkProgress,
    ) -> Result<BulkReport, ConfigError> {
        self.bulk.fetch_many(data_type, adapters, keys, options, progress)
    }

    /// Drop one cached entry (user-initiated refresh of a single view).
    pub fn invalidate(&self, data_type: &str, key: &QueryKey) -> Result<bool, CacheError> {
        self.cache.invalidate(data_type, key)
    }

    /// Drop the whole cache (user-initiated full refresh).
    pub fn clear_all(&self) -> Result<(), CacheError> {
        self.cache.clear_all()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
