//! Single-file JSON cache store.
//!
//! Layout on disk:
//!
//! ```json
//! { "entries": { "stock_prices::TCS.NS": { "value": ..., "timestamp": ..., "ttl_seconds": 21600 } },
//!   "last_updated": "2025-06-02T04:30:00Z" }
//! ```
//!
//! Features:
//! - Loaded once on open; a missing file is an empty cache
//! - Corrupt files are quarantined (`{name}.quarantined`) and the cache starts cold
//! - Every mutation flushes the whole document atomically (unique temp file in the same dir, rename)
//! - Expired entries read as absent but are only removed by `purge_expired`

use super::ttl::TtlTable;
use crate::clock::Clock;
use crate::query::{cache_key, QueryKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

/// Durable storage failures. The in-memory state is already updated when these are returned.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(String),

    #[error("cache serialization error: {0}")]
    Serialization(String),
}

/// One cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    /// When the value was written.
    pub timestamp: DateTime<Utc>,
    /// Resolved from the TTL table at write time.
    pub ttl_seconds: u64,
    /// Source that produced the value, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl CacheEntry {
    /// Expired iff `now - timestamp > ttl_seconds`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age_ms = now.signed_duration_since(self.timestamp).num_milliseconds();
        let ttl_ms = i64::try_from(self.ttl_seconds)
            .unwrap_or(i64::MAX)
            .saturating_mul(1_000);
        age_ms > ttl_ms
    }
}

/// A pending write for [`CacheStore::put_bulk`].
#[derive(Debug, Clone)]
pub struct CacheWrite {
    pub data_type: String,
    pub key: QueryKey,
    pub value: Value,
    pub source: Option<String>,
}

impl CacheWrite {
    pub fn new(data_type: impl Into<String>, key: QueryKey, value: Value) -> Self {
        Self {
            data_type: data_type.into(),
            key,
            value,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Entry counts, split by freshness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
}

/// The persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheDocument {
    #[serde(default)]
    entries: BTreeMap<String, CacheEntry>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

/// Shared key→entry store guarded by one coarse lock.
///
/// Construct once at startup and share behind an `Arc`.
pub struct CacheStore {
    path: Option<PathBuf>,
    ttl: TtlTable,
    clock: Arc<dyn Clock>,
    doc: RwLock<CacheDocument>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("path", &self.path)
            .field("entries", &self.read().entries.len())
            .finish()
    }
}

impl CacheStore {
    /// Open the store at `path`, degrading to an empty cache if it is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>, ttl: TtlTable, clock: Arc<dyn Clock>) -> Self {
        let path = path.into();
        let doc = load_document(&path);
        debug!(path = %path.display(), entries = doc.entries.len(), "cache opened");
        Self {
            path: Some(path),
            ttl,
            clock,
            doc: RwLock::new(doc),
        }
    }

    /// A store that never touches disk.
    pub fn in_memory(ttl: TtlTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: None,
            ttl,
            clock,
            doc: RwLock::new(CacheDocument::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn ttl_table(&self) -> &TtlTable {
        &self.ttl
    }

    /// Fresh value for `(data_type, key)`, or `None` on miss or expiry.
    pub fn get(&self, data_type: &str, key: &QueryKey) -> Option<Value> {
        self.get_entry(data_type, key).map(|entry| entry.value)
    }

    /// Fresh entry including its original timestamp and provenance.
    pub fn get_entry(&self, data_type: &str, key: &QueryKey) -> Option<CacheEntry> {
        let now = self.clock.now();
        let doc = self.read();
        doc.entries
            .get(&cache_key(data_type, key))
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    /// Upsert one value and flush.
    pub fn put(&self, data_type: &str, key: &QueryKey, value: Value) -> Result<(), CacheError> {
        self.put_bulk(vec![CacheWrite::new(data_type, key.clone(), value)])
    }

    /// Upsert one value tagged with the source that produced it, and flush.
    pub fn put_from_source(
        &self,
        data_type: &str,
        key: &QueryKey,
        value: Value,
        source: &str,
    ) -> Result<(), CacheError> {
        self.put_bulk(vec![
            CacheWrite::new(data_type, key.clone(), value).with_source(source)
        ])
    }

    /// Upsert a batch under one lock acquisition with a single flush.
    pub fn put_bulk(&self, writes: Vec<CacheWrite>) -> Result<(), CacheError> {
        if writes.is_empty() {
            return Ok(());
        }
        let now = self.clock.now();
        let mut doc = self.write();
        for write in writes {
            let ttl_seconds = self.ttl.resolve(&write.data_type, now);
            doc.entries.insert(
                cache_key(&write.data_type, &write.key),
                CacheEntry {
                    value: write.value,
                    timestamp: now,
                    ttl_seconds,
                    source: write.source,
                },
            );
        }
        doc.last_updated = Some(now);
        self.flush_locked(&doc)
    }

    /// Drop one entry regardless of its TTL. Returns whether anything was removed.
    pub fn invalidate(&self, data_type: &str, key: &QueryKey) -> Result<bool, CacheError> {
        let mut doc = self.write();
        let removed = doc.entries.remove(&cache_key(data_type, key)).is_some();
        if removed {
            doc.last_updated = Some(self.clock.now());
            self.flush_locked(&doc)?;
        }
        Ok(removed)
    }

    /// Drop every entry.
    pub fn clear_all(&self) -> Result<(), CacheError> {
        let mut doc = self.write();
        doc.entries.clear();
        doc.last_updated = Some(self.clock.now());
        self.flush_locked(&doc)
    }

    /// Eagerly remove expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = self.clock.now();
        let mut doc = self.write();
        let before = doc.entries.len();
        doc.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - doc.entries.len();
        if removed > 0 {
            doc.last_updated = Some(now);
            self.flush_locked(&doc)?;
        }
        Ok(removed)
    }

    /// Write the current state to disk.
    pub fn flush(&self) -> Result<(), CacheError> {
        let doc = self.write();
        self.flush_locked(&doc)
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let doc = self.read();
        let expired = doc.entries.values().filter(|e| e.is_expired(now)).count();
        CacheStats {
            total: doc.entries.len(),
            valid: doc.entries.len() - expired,
            expired,
        }
    }

    /// Stored entry count, expired entries included.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Composite keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.read().entries.keys().cloned().collect()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.read().last_updated
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheDocument> {
        self.doc.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheDocument> {
        self.doc.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called with the write lock held so flushes are serialized.
    fn flush_locked(&self, doc: &CacheDocument) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                fs::create_dir_all(parent)
                    .map_err(|e| CacheError::Io(format!("failed to create dir: {e}")))?;
                parent
            }
            None => Path::new("."),
        };

        let bytes = serde_json::to_vec(doc).map_err(|e| CacheError::Serialization(e.to_string()))?;
        // Uniquely named per flush, so concurrent writers never share a temp file.
        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|e| CacheError::Io(format!("create temp file in {}: {e}", dir.display())))?;
        tmp.write_all(&bytes)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| CacheError::Io(format!("write {}: {e}", tmp.path().display())))?;

        // Atomic rename
        tmp.persist(path)
            .map_err(|e| CacheError::Io(format!("atomic rename failed: {}", e.error)))?;
        Ok(())
    }
}

/// `{dir}/{file_name}.{suffix}`
fn sibling_path(path: &Path, suffix: &str) -> Result<PathBuf, CacheError> {
    let name = path
        .file_name()
        .ok_or_else(|| CacheError::Io(format!("cache path has no file name: {}", path.display())))?;
    let mut name = name.to_os_string();
    name.push(".");
    name.push(suffix);
    Ok(path.with_file_name(name))
}

fn load_document(path: &Path) -> CacheDocument {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return CacheDocument::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cache unreadable, starting cold");
            return CacheDocument::default();
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "quarantining corrupt cache file");
            if let Ok(quarantine) = sibling_path(path, "quarantined") {
                let _ = fs::rename(path, quarantine);
            }
            CacheDocument::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::time::Duration;

    fn store(clock: Arc<ManualClock>) -> CacheStore {
        let ttl = TtlTable::new(600)
            .with_fixed("market_indices", 300)
            .with_fixed("stock_lists", 86_400);
        CacheStore::in_memory(ttl, clock)
    }

    #[test]
    fn put_then_get() {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let cache = store(clock);
        let key = QueryKey::single("^NSEI");

        cache.put("market_indices", &key, json!({"price": 22500.5})).unwrap();

        assert_eq!(cache.get("market_indices", &key), Some(json!({"price": 22500.5})));
        assert_eq!(cache.get("stock_prices", &key), None);
    }

    #[test]
    fn expiry_is_exact() {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let cache = store(clock.clone());
        let key = QueryKey::single("^NSEI");
        cache.put("market_indices", &key, json!(1)).unwrap();

        clock.advance(Duration::from_secs(300));
        assert!(cache.get("market_indices", &key).is_some(), "age == ttl is still fresh");

        clock.advance(Duration::from_millis(1));
        assert!(cache.get("market_indices", &key).is_none());
        assert_eq!(cache.len(), 1, "expiry is lazy");
    }

    #[test]
    fn ttl_depends_on_data_type() {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let cache = store(clock.clone());
        let key = QueryKey::single("NIFTY 50");
        cache.put("market_indices", &key, json!("a")).unwrap();
        cache.put("stock_lists", &key, json!("b")).unwrap();

        clock.advance(Duration::from_secs(3_600));
        assert!(cache.get("market_indices", &key).is_none());
        assert_eq!(cache.get("stock_lists", &key), Some(json!("b")));
    }

    #[test]
    fn repeated_put_overwrites() {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let cache = store(clock);
        let key = QueryKey::single("TCS.NS");

        cache.put("stock_prices", &key, json!(1)).unwrap();
        cache.put("stock_prices", &key, json!(2)).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("stock_prices", &key), Some(json!(2)));
    }

    #[test]
    fn invalidate_removes_fresh_entry() {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let cache = store(clock);
        let key = QueryKey::single("TCS.NS");
        cache.put("stock_prices", &key, json!(1)).unwrap();

        assert!(cache.invalidate("stock_prices", &key).unwrap());
        assert!(cache.get("stock_prices", &key).is_none());
        assert!(!cache.invalidate("stock_prices", &key).unwrap());
    }

    #[test]
    fn stats_and_purge() {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let cache = store(clock.clone());
        cache.put("market_indices", &"^NSEI".into(), json!(1)).unwrap();
        cache.put("stock_lists", &"NIFTY 50".into(), json!(2)).unwrap();

        clock.advance(Duration::from_secs(301));
        assert_eq!(
            cache.stats(),
            CacheStats {
                total: 2,
                valid: 1,
                expired: 1
            }
        );

        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert_eq!(cache.keys(), vec!["stock_lists::NIFTY 50".to_string()]);
    }

    #[test]
    fn entry_keeps_source_and_timestamp() {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let cache = store(clock.clone());
        let key = QueryKey::single("GC=F");
        cache
            .put_from_source("commodities", &key, json!(2350.1), "yfinance")
            .unwrap();
        let written_at = clock.now();
        clock.advance(Duration::from_secs(10));

        let entry = cache.get_entry("commodities", &key).unwrap();
        assert_eq!(entry.source.as_deref(), Some("yfinance"));
        assert_eq!(entry.timestamp, written_at);
        assert_eq!(entry.ttl_seconds, 600);
        assert_eq!(cache.last_updated(), Some(written_at));
    }

    #[test]
    fn is_expired_handles_huge_ttl() {
        let entry = CacheEntry {
            value: Value::Null,
            timestamp: DateTime::from_timestamp(0, 0).unwrap(),
            ttl_seconds: u64::MAX,
            source: None,
        };
        assert!(!entry.is_expired(Utc::now()));
    }
}
