//! On-disk behavior of the cache store: persistence across reopen, atomic
//! flushes, and degrading to a cold cache when the file is damaged.

use chrono::{TimeZone, Utc};
use marketfeed_core::cache::{MarketHours, TtlRule};
use marketfeed_core::{CacheStore, CacheWrite, ManualClock, QueryKey, TtlTable};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn ttl() -> TtlTable {
    TtlTable::new(21_600).with_fixed("market_indices", 300)
}

#[test]
fn entries_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache").join("data_cache.json");
    let clock = Arc::new(ManualClock::at_unix(1_717_300_000));

    {
        let cache = CacheStore::open(&path, ttl(), clock.clone());
        assert!(cache.is_empty());
        cache
            .put_from_source("stock_prices", &"TCS.NS".into(), json!({"ltp": 3890.5}), "yfinance")
            .unwrap();
        cache
            .put("stock_prices", &QueryKey::set(["INFY.NS", "TCS.NS"]), json!([1, 2]))
            .unwrap();
    }
    assert!(path.exists());

    let reopened = CacheStore::open(&path, ttl(), clock.clone());
    assert_eq!(reopened.len(), 2);
    assert_eq!(
        reopened.get("stock_prices", &"TCS.NS".into()),
        Some(json!({"ltp": 3890.5}))
    );
    assert_eq!(
        reopened.get("stock_prices", &QueryKey::set(["TCS.NS", "INFY.NS"])),
        Some(json!([1, 2]))
    );
    let entry = reopened.get_entry("stock_prices", &"TCS.NS".into()).unwrap();
    assert_eq!(entry.source.as_deref(), Some("yfinance"));
    assert_eq!(entry.ttl_seconds, 21_600);
}

#[test]
fn persisted_layout_uses_composite_keys() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data_cache.json");
    let clock = Arc::new(ManualClock::at_unix(1_717_300_000));
    let cache = CacheStore::open(&path, ttl(), clock);
    cache.put("market_indices", &"^NSEI".into(), json!(22500.5)).unwrap();

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let entry = &raw["entries"]["market_indices::^NSEI"];
    assert_eq!(entry["value"], json!(22500.5));
    assert_eq!(entry["ttl_seconds"], json!(300));
    assert!(entry["timestamp"].is_string());
    assert!(raw["last_updated"].is_string());
    let files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(files, vec![std::ffi::OsString::from("data_cache.json")]);
}

#[test]
fn corrupt_file_is_quarantined_and_cache_starts_cold() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data_cache.json");
    std::fs::write(&path, b"{\"entries\": {\"stock_prices::TCS").unwrap();

    let clock = Arc::new(ManualClock::at_unix(1_717_300_000));
    let cache = CacheStore::open(&path, ttl(), clock);

    assert!(cache.is_empty());
    assert!(dir.path().join("data_cache.json.quarantined").exists());

    cache.put("stock_prices", &"TCS.NS".into(), json!(1)).unwrap();
    assert_eq!(cache.get("stock_prices", &"TCS.NS".into()), Some(json!(1)));
}

#[test]
fn file_without_source_field_still_loads() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data_cache.json");
    std::fs::write(
        &path,
        r#"{"entries":{"commodities::GC=F":{"value":2350.1,"timestamp":"2024-06-02T03:46:40Z","ttl_seconds":300}},"last_updated":"2024-06-02T03:46:40Z"}"#,
    )
    .unwrap();

    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 2, 3, 50, 0).unwrap(),
    ));
    let cache = CacheStore::open(&path, ttl(), clock.clone());
    let entry = cache.get_entry("commodities", &"GC=F".into()).unwrap();
    assert_eq!(entry.value, json!(2350.1));
    assert_eq!(entry.source, None);

    clock.advance(Duration::from_secs(300));
    assert!(cache.get("commodities", &"GC=F".into()).is_none());
}

#[test]
fn bulk_write_and_clear_all_hit_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data_cache.json");
    let clock = Arc::new(ManualClock::at_unix(1_717_300_000));
    let cache = CacheStore::open(&path, ttl(), clock.clone());

    let writes = (0..25)
        .map(|i| CacheWrite::new("stock_prices", QueryKey::single(format!("SYM{i}.NS")), json!(i)))
        .collect();
    cache.put_bulk(writes).unwrap();
    assert_eq!(CacheStore::open(&path, ttl(), clock.clone()).len(), 25);

    cache.clear_all().unwrap();
    assert!(cache.is_empty());
    assert!(CacheStore::open(&path, ttl(), clock).is_empty());
}

#[test]
fn market_hours_ttl_is_fixed_at_write_time() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data_cache.json");
    // Tuesday 2024-06-04 10:00 IST
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 4, 4, 30, 0).unwrap(),
    ));
    let table = ttl().with_rule("stock_prices", TtlRule::MarketHours(MarketHours::default()));
    let cache = CacheStore::open(&path, table, clock.clone());

    cache.put("stock_prices", &"TCS.NS".into(), json!(1)).unwrap();
    let entry = cache.get_entry("stock_prices", &"TCS.NS".into()).unwrap();
    assert_eq!(entry.ttl_seconds, 300);

    // Moving past the close does not stretch an entry written during the session.
    clock.advance(Duration::from_secs(301));
    assert!(cache.get("stock_prices", &"TCS.NS".into()).is_none());
}

#[test]
fn concurrent_writers_never_leave_a_torn_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data_cache.json");
    let clock = Arc::new(ManualClock::at_unix(1_717_300_000));
    // Two stores on one file stand in for two processes sharing the cache.
    let stores: Vec<Arc<CacheStore>> = (0..2)
        .map(|_| Arc::new(CacheStore::open(&path, ttl(), clock.clone())))
        .collect();

    let handles: Vec<_> = stores
        .iter()
        .enumerate()
        .map(|(writer, store)| {
            let store = Arc::clone(store);
            std::thread::spawn(move || {
                for i in 0..40 {
                    store
                        .put("stock_prices", &QueryKey::single(format!("W{writer}-{i}")), json!(i))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let reopened = CacheStore::open(&path, ttl(), clock);
    assert_eq!(reopened.len(), 40);
    assert!(!dir.path().join("data_cache.json.quarantined").exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}
