//! Per-source circuit breaker for upstream rate limiting and IP bans.
//!
//! When a source keeps answering with rate-limit responses, the breaker trips
//! and the orchestrator skips that source for a cooldown period instead of
//! burning retries against it.

use crate::clock::{to_chrono, Clock};
use crate::config::BreakerSettings;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, requests are allowed.
    Closed,
    /// Tripped, all requests are refused until the cooldown expires.
    Open { tripped_at: DateTime<Utc> },
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
}

/// Circuit breaker guarding one source.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    cooldown: Duration,
    failure_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration, failure_threshold: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
            }),
            cooldown,
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn from_settings(settings: &BreakerSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.cooldown_secs),
            settings.failure_threshold,
        )
    }

    /// Whether a request may be sent at `now`. Closes the breaker once the cooldown has elapsed.
    pub fn is_allowed(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open { tripped_at } => {
                if now.signed_duration_since(tripped_at) >= to_chrono(self.cooldown) {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// A successful request resets the failure counter.
    pub fn record_success(&self) {
        self.lock().consecutive_failures = 0;
    }

    /// Count a rate-limit failure, tripping the breaker after `failure_threshold` in a row.
    pub fn record_failure(&self, now: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.failure_threshold {
            inner.state = BreakerState::Open { tripped_at: now };
        }
    }

    /// A failure that is not a rate limit ends the streak.
    pub fn record_other_failure(&self) {
        self.lock().consecutive_failures = 0;
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Remaining cooldown (zero if not tripped).
    pub fn remaining_cooldown(&self, now: DateTime<Utc>) -> Duration {
        match self.lock().state {
            BreakerState::Closed => Duration::ZERO,
            BreakerState::Open { tripped_at } => {
                let elapsed = now
                    .signed_duration_since(tripped_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                self.cooldown.saturating_sub(elapsed)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lazily created breakers keyed by source name.
///
/// Sources are upstream hosts, so a breaker is shared across every data type
/// that uses the same source.
#[derive(Debug)]
pub struct BreakerBoard {
    settings: BreakerSettings,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerBoard {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn breaker(&self, source: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(source.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::from_settings(&self.settings))),
        )
    }

    /// Sources whose breaker is open at the clock's current time.
    pub fn open_sources(&self, clock: &dyn Clock) -> Vec<String> {
        let now = clock.now();
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut open: Vec<String> = breakers
            .iter()
            .filter(|(_, b)| !b.is_allowed(now))
            .map(|(name, _)| name.clone())
            .collect();
        open.sort();
        open
    }
}

impl Default for BreakerBoard {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}
