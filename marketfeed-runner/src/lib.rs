//! Marketfeed Runner: bulk fetch coordination and the cache-first facade.
//!
//! This crate builds on `marketfeed-core` to provide:
//! - A bulk coordinator that answers cache hits directly and fans misses out
//!   over a private, batch-sized worker pool with a batch deadline
//! - Progress observers for long batches
//! - `MarketFeed`, which wires config, orchestrator, cache and coordinator together

pub mod bulk;
pub mod feed;
pub mod progress;

pub use bulk::{cached_result, pool_size_for, BulkCoordinator, BulkReport, BulkSummary, FetchOptions};
pub use feed::MarketFeed;
pub use progress::{BulkProgress, NoProgress, TracingProgress};
