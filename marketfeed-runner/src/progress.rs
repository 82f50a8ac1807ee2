//! Progress reporting for bulk fetches.

use crate::bulk::BulkSummary;
use marketfeed_core::{FetchResult, QueryKey};

/// Observer for a running batch.
///
/// Callbacks run on the thread that called `fetch_many`, in completion order.
pub trait BulkProgress: Send {
    /// Called once per key, cache hits first, then fetched keys as they finish.
    fn on_complete(&self, key: &QueryKey, done: usize, total: usize, result: &FetchResult);

    /// Called when the entire batch is done.
    fn on_batch_complete(&self, summary: &BulkSummary);
}

/// Discards all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl BulkProgress for NoProgress {
    fn on_complete(&self, _key: &QueryKey, _done: usize, _total: usize, _result: &FetchResult) {}

    fn on_batch_complete(&self, _summary: &BulkSummary) {}
}

/// Emits progress as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl BulkProgress for TracingProgress {
    fn on_complete(&self, key: &QueryKey, done: usize, total: usize, result: &FetchResult) {
        match result.failure_reason() {
            None => tracing::debug!(
                key = %key,
                done,
                total,
                source = result.source_name().unwrap_or_default(),
                "key resolved"
            ),
            Some(reason) => tracing::debug!(key = %key, done, total, %reason, "key failed"),
        }
    }

    fn on_batch_complete(&self, summary: &BulkSummary) {
        tracing::info!(
            total = summary.total,
            cache_hits = summary.cache_hits,
            fetched = summary.fetched,
            failed = summary.failed,
            timed_out = summary.timed_out,
            "batch complete"
        );
    }
}
