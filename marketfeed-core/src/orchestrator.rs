//! Fallback orchestration: walk a data type's sources in priority order until
//! one produces a value.
//!
//! Each source gets `retry_count + 1` attempts with exponential backoff
//! between them. Retryable failures (timeouts, transport and parse errors,
//! rate limiting) are retried; anything else moves straight to the next
//! source. Only when every source has failed does the caller get a failure,
//! carrying the per-source reasons in priority order.

use crate::adapter::{invoke_guarded, AdapterMap};
use crate::backoff::BackoffPolicy;
use crate::circuit_breaker::BreakerBoard;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, FeedConfig, LoggingSettings};
use crate::query::QueryKey;
use crate::registry::{SourceRegistry, SourceSpec};
use crate::result::{FailureReason, FetchResult, Origin, SourceFailure};
use serde_json::Value;
use std::sync::Arc;

/// Resolves one query key against a data type's source chain.
///
/// Cloning is cheap and clones share the registry, clock and breakers, so a
/// clone can be handed to each worker thread.
#[derive(Clone)]
pub struct FallbackOrchestrator {
    registry: Arc<SourceRegistry>,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
    breakers: Arc<BreakerBoard>,
    logging: LoggingSettings,
}

impl FallbackOrchestrator {
    pub fn new(registry: SourceRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: Arc::new(registry),
            backoff: BackoffPolicy::default(),
            clock,
            breakers: Arc::new(BreakerBoard::default()),
            logging: LoggingSettings::default(),
        }
    }

    /// Registry, backoff, breakers and logging switches from a loaded config.
    pub fn from_config(config: &FeedConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config.registry()?, clock)
            .with_backoff(config.backoff.policy())
            .with_breakers(BreakerBoard::new(config.circuit_breaker.clone()))
            .with_logging(config.logging))
    }

    /// Orchestrator over the builtin source table and the wall clock.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_config(&FeedConfig::builtin(), Arc::new(SystemClock))
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_breakers(mut self, breakers: BreakerBoard) -> Self {
        self.breakers = Arc::new(breakers);
        self
    }

    pub fn with_logging(mut self, logging: LoggingSettings) -> Self {
        self.logging = logging;
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn breakers(&self) -> &BreakerBoard {
        &self.breakers
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Fetch `key` for `data_type`, falling back across its enabled sources.
    ///
    /// Only an unknown data type is an error; every upstream problem is
    /// reported through [`FetchResult::Failure`].
    pub fn fetch_with_fallback(
        &self,
        data_type: &str,
        adapters: &AdapterMap,
        key: &QueryKey,
    ) -> Result<FetchResult, ConfigError> {
        let sources = self.registry.sources_for(data_type)?;
        Ok(self.run_chain(data_type, &sources, adapters, key))
    }

    /// Run an already resolved source chain. `sources` must be in priority order.
    pub fn run_chain(
        &self,
        data_type: &str,
        sources: &[SourceSpec],
        adapters: &AdapterMap,
        key: &QueryKey,
    ) -> FetchResult {
        if sources.is_empty() {
            if self.logging.log_failures {
                tracing::warn!(data_type, key = %key, "no enabled sources");
            }
            return FetchResult::failure(FailureReason::NoSourcesConfigured);
        }

        let mut attempted = Vec::with_capacity(sources.len());
        for (rank, source) in sources.iter().enumerate() {
            match self.try_source(data_type, source, adapters, key) {
                Ok(value) => {
                    if rank > 0 && self.logging.log_fallback_usage {
                        tracing::info!(
                            data_type,
                            key = %key,
                            source = %source.name,
                            skipped = rank,
                            "served by fallback source"
                        );
                    }
                    return FetchResult::Success {
                        value,
                        source_name: source.name.clone(),
                        fetched_at: self.clock.now(),
                        origin: Origin::Upstream,
                    };
                }
                Err(reason) => {
                    if self.logging.log_failures {
                        tracing::warn!(
                            data_type,
                            key = %key,
                            source = %source.name,
                            %reason,
                            "source failed"
                        );
                    }
                    attempted.push(SourceFailure {
                        source: source.name.clone(),
                        reason,
                    });
                }
            }
        }

        if self.logging.log_failures {
            tracing::warn!(data_type, key = %key, sources = attempted.len(), "all sources exhausted");
        }
        FetchResult::failure(FailureReason::AllSourcesExhausted { attempted })
    }

    /// All attempts against one source. Returns the last failure if none succeeded.
    fn try_source(
        &self,
        data_type: &str,
        source: &SourceSpec,
        adapters: &AdapterMap,
        key: &QueryKey,
    ) -> Result<Value, FailureReason> {
        let Some(adapter) = adapters.get(&source.name) else {
            return Err(FailureReason::AdapterMissing);
        };
        let breaker = self.breakers.breaker(&source.name);
        if !breaker.is_allowed(self.clock.now()) {
            return Err(FailureReason::CircuitOpen);
        }

        let attempts = source.attempts();
        let mut attempt = 1;
        loop {
            if self.logging.log_source_attempts {
                tracing::debug!(data_type, key = %key, source = %source.name, attempt, attempts, "fetching");
            }

            let started = self.clock.now();
            let outcome = invoke_guarded(adapter.as_ref(), key, source);
            let elapsed = self.clock.now().signed_duration_since(started);
            let late = elapsed.to_std().is_ok_and(|e| e > source.timeout);

            let reason = match outcome {
                // Whatever arrives after the source's timeout is discarded.
                _ if late => {
                    if self.logging.log_source_attempts {
                        tracing::debug!(
                            source = %source.name,
                            elapsed_ms = elapsed.num_milliseconds(),
                            timeout_ms = source.timeout.as_millis() as u64,
                            "adapter exceeded its timeout"
                        );
                    }
                    FailureReason::Timeout
                }
                // A source with nothing to say about the key is the same as a miss.
                Ok(Value::Null) => FailureReason::NotFound,
                Ok(value) => {
                    breaker.record_success();
                    return Ok(value);
                }
                Err(reason) => reason,
            };

            if matches!(reason, FailureReason::RateLimited { .. }) {
                breaker.record_failure(self.clock.now());
            } else {
                breaker.record_other_failure();
            }
            if !reason.is_retryable()
                || attempt >= attempts
                || !breaker.is_allowed(self.clock.now())
            {
                return Err(reason);
            }

            let delay = self.backoff.delay_after(attempt);
            if self.logging.log_source_attempts {
                tracing::debug!(source = %source.name, attempt, delay_ms = delay.as_millis() as u64, %reason, "retrying");
            }
            self.clock.sleep(delay);
            attempt += 1;
        }
    }
}
