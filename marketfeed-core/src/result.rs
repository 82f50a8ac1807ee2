//! Fetch outcomes and the failure taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Why a fetch (or a single attempt) failed.
///
/// The first five variants are what adapters report per attempt. The rest are
/// produced by the orchestrator itself.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FailureReason {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("not found")]
    NotFound,

    #[error("rate limited by upstream")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("no sources configured")]
    NoSourcesConfigured,

    #[error("all sources exhausted ({})", describe_attempts(.attempted))]
    AllSourcesExhausted { attempted: Vec<SourceFailure> },

    #[error("no adapter registered for source")]
    AdapterMissing,

    #[error("source blocked by circuit breaker")]
    CircuitOpen,
}

impl FailureReason {
    /// Whether another attempt against the same source could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::TransportError(_) | Self::ParseError(_) | Self::RateLimited { .. }
        )
    }

    /// Source names attempted, in the order tried. Empty unless `AllSourcesExhausted`.
    pub fn attempted_sources(&self) -> Vec<&str> {
        match self {
            Self::AllSourcesExhausted { attempted } => {
                attempted.iter().map(|a| a.source.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// The last failure recorded against one source during a fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source: String,
    pub reason: FailureReason,
}

fn describe_attempts(attempted: &[SourceFailure]) -> String {
    attempted
        .iter()
        .map(|a| format!("{}: {}", a.source, a.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Where a successful value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Fetched from an upstream source during this request.
    Upstream,
    /// Served from the persistent cache.
    Cache,
}

/// Outcome of fetching one query key.
///
/// Created once per resolution and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FetchResult {
    Success {
        value: Value,
        source_name: String,
        fetched_at: DateTime<Utc>,
        origin: Origin,
    },
    Failure {
        reason: FailureReason,
    },
}

impl FetchResult {
    pub fn failure(reason: FailureReason) -> Self {
        Self::Failure { reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Success { value, .. } => Some(value),
            Self::Failure { .. } => None,
        }
    }

    pub fn source_name(&self) -> Option<&str> {
        match self {
            Self::Success { source_name, .. } => Some(source_name),
            Self::Failure { .. } => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { reason } => Some(reason),
        }
    }

    pub fn origin(&self) -> Option<Origin> {
        match self {
            Self::Success { origin, .. } => Some(*origin),
            Self::Failure { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_not_retryable() {
        assert!(!FailureReason::NotFound.is_retryable());
        assert!(!FailureReason::AdapterMissing.is_retryable());
        assert!(!FailureReason::CircuitOpen.is_retryable());
        assert!(FailureReason::Timeout.is_retryable());
        assert!(FailureReason::RateLimited {
            retry_after_secs: Some(60)
        }
        .is_retryable());
    }

    #[test]
    fn exhausted_message_lists_sources() {
        let reason = FailureReason::AllSourcesExhausted {
            attempted: vec![
                SourceFailure {
                    source: "yfinance".into(),
                    reason: FailureReason::Timeout,
                },
                SourceFailure {
                    source: "nse_api".into(),
                    reason: FailureReason::NotFound,
                },
            ],
        };
        assert_eq!(
            reason.to_string(),
            "all sources exhausted (yfinance: request timed out; nse_api: not found)"
        );
        assert_eq!(reason.attempted_sources(), vec!["yfinance", "nse_api"]);
    }

    #[test]
    fn accessors_on_failure() {
        let result = FetchResult::failure(FailureReason::NoSourcesConfigured);
        assert!(result.is_failure());
        assert!(result.value().is_none());
        assert_eq!(
            result.failure_reason(),
            Some(&FailureReason::NoSourcesConfigured)
        );
    }
}
