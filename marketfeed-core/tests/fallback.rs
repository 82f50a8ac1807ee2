//! Integration tests for the fallback orchestrator.
//!
//! All timing goes through a `ManualClock`, so backoff is asserted on the
//! recorded sleeps instead of real time passing.

use marketfeed_core::{
    AdapterMap, BackoffPolicy, DataTypeSpec, FailureReason, FallbackOrchestrator, FeedConfig,
    ManualClock, Origin, SourceFailure, SourceRegistry, SourceSpec,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn setup(sources: Vec<SourceSpec>) -> (FallbackOrchestrator, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_unix(1_717_300_000));
    let registry = SourceRegistry::new([DataTypeSpec::new("stock_prices", sources)]).unwrap();
    (FallbackOrchestrator::new(registry, clock.clone()), clock)
}

fn counting_failure(counter: Arc<AtomicU32>) -> impl Fn(&marketfeed_core::QueryKey) -> anyhow::Result<serde_json::Value> {
    move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(FailureReason::Timeout.into())
    }
}

#[test]
fn primary_failure_falls_back_to_secondary() {
    let (orch, clock) = setup(vec![
        SourceSpec::new("yfinance", 1).with_retry_count(2),
        SourceSpec::new("nse_api", 2),
    ]);
    let primary_calls = Arc::new(AtomicU32::new(0));
    let adapters = AdapterMap::new()
        .with_fn("yfinance", counting_failure(primary_calls.clone()))
        .with_fn("nse_api", |key| Ok(json!({ "symbol": key.normalized(), "ltp": 3890.5 })));

    let result = orch
        .fetch_with_fallback("stock_prices", &adapters, &"TCS.NS".into())
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.source_name(), Some("nse_api"));
    assert_eq!(result.origin(), Some(Origin::Upstream));
    assert_eq!(result.value(), Some(&json!({"symbol": "TCS.NS", "ltp": 3890.5})));

    // retry_count 2 → three attempts, with backoff between them only.
    assert_eq!(primary_calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_secs(3), Duration::from_secs(9)]
    );
}

#[test]
fn every_source_failing_lists_each_once_in_priority_order() {
    let (orch, _) = setup(vec![
        SourceSpec::new("bse_api", 3),
        SourceSpec::new("yfinance", 1),
        SourceSpec::new("nse_api", 2),
    ]);
    let orch = orch.with_backoff(BackoffPolicy::none());
    let adapters = AdapterMap::new()
        .with_fn("yfinance", |_| Err(anyhow::anyhow!("connection refused")))
        .with_fn("nse_api", |_| Err(FailureReason::NotFound.into()))
        .with_fn("bse_api", |_| Err(FailureReason::ParseError("bad csv".into()).into()));

    let result = orch
        .fetch_with_fallback("stock_prices", &adapters, &"INFY.NS".into())
        .unwrap();
    let reason = result.failure_reason().expect("expected a failure");

    assert_eq!(reason.attempted_sources(), vec!["yfinance", "nse_api", "bse_api"]);
    match reason {
        FailureReason::AllSourcesExhausted { attempted } => {
            assert!(matches!(attempted[0].reason, FailureReason::TransportError(_)));
            assert_eq!(
                attempted[1],
                SourceFailure {
                    source: "nse_api".into(),
                    reason: FailureReason::NotFound
                }
            );
            assert_eq!(attempted[2].reason, FailureReason::ParseError("bad csv".into()));
        }
        other => panic!("unexpected reason: {other:?}"),
    }
}

#[test]
fn not_found_is_not_retried() {
    let (orch, clock) = setup(vec![SourceSpec::new("yfinance", 1).with_retry_count(4)]);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let adapters = AdapterMap::new().with_fn("yfinance", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(FailureReason::NotFound.into())
    });

    let result = orch
        .fetch_with_fallback("stock_prices", &adapters, &"DELISTED.NS".into())
        .unwrap();

    assert!(result.is_failure());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(clock.sleeps().is_empty());
}

#[test]
fn retry_recovers_on_same_source() {
    let (orch, clock) = setup(vec![
        SourceSpec::new("yfinance", 1).with_retry_count(3),
        SourceSpec::new("nse_api", 2),
    ]);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let adapters = AdapterMap::new()
        .with_fn("yfinance", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(FailureReason::Timeout.into())
            } else {
                Ok(json!(101.25))
            }
        })
        .with_fn("nse_api", |_| panic!("secondary must not be called"));

    let result = orch
        .fetch_with_fallback("stock_prices", &adapters, &"HDFCBANK.NS".into())
        .unwrap();

    assert_eq!(result.source_name(), Some("yfinance"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(3)]);
}

#[test]
fn panicking_adapter_does_not_escape() {
    let (orch, _) = setup(vec![SourceSpec::new("yfinance", 1), SourceSpec::new("nse_api", 2)]);
    let orch = orch.with_backoff(BackoffPolicy::none());
    let adapters = AdapterMap::new()
        .with_fn("yfinance", |_| panic!("index out of bounds"))
        .with_fn("nse_api", |_| Ok(json!("ok")));

    let result = orch
        .fetch_with_fallback("stock_prices", &adapters, &"SBIN.NS".into())
        .unwrap();
    assert_eq!(result.source_name(), Some("nse_api"));
}

#[test]
fn disabled_data_type_reports_no_sources() {
    let clock = Arc::new(ManualClock::at_unix(0));
    let registry = SourceRegistry::new([
        DataTypeSpec::new("commodities", vec![SourceSpec::new("yfinance", 1)]).disabled(),
    ])
    .unwrap();
    let orch = FallbackOrchestrator::new(registry, clock);

    let result = orch
        .fetch_with_fallback("commodities", &AdapterMap::new(), &"GC=F".into())
        .unwrap();
    assert_eq!(result.failure_reason(), Some(&FailureReason::NoSourcesConfigured));
}

#[test]
fn success_timestamp_comes_from_clock() {
    let (orch, clock) = setup(vec![SourceSpec::new("yfinance", 1)]);
    let adapters = AdapterMap::new().with_fn("yfinance", |_| Ok(json!(1)));

    let result = orch
        .fetch_with_fallback("stock_prices", &adapters, &"TCS.NS".into())
        .unwrap();
    match result {
        marketfeed_core::FetchResult::Success { fetched_at, .. } => {
            assert_eq!(fetched_at, marketfeed_core::Clock::now(clock.as_ref()));
        }
        other => panic!("expected success, got {other:?}"),
    }
}

#[test]
fn builtin_config_drives_the_chain() {
    let clock = Arc::new(ManualClock::at_unix(1_717_300_000));
    let orch = FallbackOrchestrator::from_config(&FeedConfig::builtin(), clock.clone()).unwrap();
    let sources = orch.registry().enabled_sources("stock_prices").unwrap();
    assert_eq!(sources.first().map(String::as_str), Some("yfinance"));

    let mut adapters = AdapterMap::new();
    for name in &sources {
        adapters.register_fn(name.clone(), |_| Err(FailureReason::Timeout.into()));
    }
    let result = orch
        .fetch_with_fallback("stock_prices", &adapters, &"TCS.NS".into())
        .unwrap();
    let reason = result.failure_reason().unwrap();
    let attempted: Vec<String> = reason.attempted_sources().iter().map(|s| s.to_string()).collect();
    assert_eq!(attempted, sources);
}

#[test]
fn value_arriving_after_source_timeout_falls_back() {
    let (orch, clock) = setup(vec![
        SourceSpec::new("yfinance", 1)
            .with_timeout(Duration::from_secs(10))
            .with_retry_count(1),
        SourceSpec::new("nse_api", 2),
    ]);
    let orch = orch.with_backoff(BackoffPolicy::none());
    let slow_clock = Arc::clone(&clock);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let adapters = AdapterMap::new()
        .with_fn("yfinance", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            slow_clock.advance(Duration::from_secs(600));
            Ok(json!("late"))
        })
        .with_fn("nse_api", |_| Ok(json!("on time")));

    let result = orch
        .fetch_with_fallback("stock_prices", &adapters, &"TCS.NS".into())
        .unwrap();

    assert_eq!(result.source_name(), Some("nse_api"));
    assert_eq!(result.value(), Some(&json!("on time")));
    // Timeout is retryable, so the slow source used both of its attempts.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
