//! Marketfeed Core: multi-source fetching with fallback and a persistent TTL cache.
//!
//! This crate contains:
//! - The source registry (which upstream sources serve which data type, in what order)
//! - Fetcher adapters, including a generic JSON-over-HTTP adapter
//! - The fallback orchestrator with per-source retries, backoff and circuit breakers
//! - A file-backed cache with per-data-type and market-hours-aware TTLs
//! - TOML configuration with a builtin source table

pub mod adapter;
pub mod backoff;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod http;
pub mod orchestrator;
pub mod query;
pub mod registry;
pub mod result;

pub use adapter::{AdapterMap, FetcherAdapter, FnAdapter};
pub use backoff::BackoffPolicy;
pub use cache::{CacheEntry, CacheError, CacheStats, CacheStore, CacheWrite, TtlRule, TtlTable};
pub use circuit_breaker::{BreakerBoard, CircuitBreaker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, FeedConfig};
pub use http::HttpJsonAdapter;
pub use orchestrator::FallbackOrchestrator;
pub use query::{cache_key, QueryKey};
pub use registry::{DataTypeSpec, SourceRegistry, SourceSpec};
pub use result::{FailureReason, FetchResult, Origin, SourceFailure};
