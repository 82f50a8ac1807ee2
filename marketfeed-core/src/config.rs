//! Declarative configuration: data types, sources, TTLs, backoff, bulk limits.
//!
//! Loaded once at process start from TOML. There is no hot reload.
//!
//! ```toml
//! [data_types.stock_prices]
//! enabled = true
//!
//! [[data_types.stock_prices.sources]]
//! name = "yfinance"
//! priority = 1
//! timeout_secs = 10
//! retry_count = 2
//!
//! [sources.nse_api]
//! base_url = "https://www.nseindia.com/api"
//! requires_session = true
//!
//! [cache]
//! path = "cache/marketfeed.json"
//!
//! [cache.ttl.stock_prices]
//! kind = "fixed"
//! secs = 21600
//! ```

use crate::backoff::BackoffPolicy;
use crate::cache::ttl::{TtlRule, TtlTable};
use crate::registry::{DataTypeSpec, SourceConfig, SourceRegistry, SourceSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration mistakes. These indicate a programming or deployment error,
/// not a runtime condition, and are the only errors the fetch API returns as `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown data type '{data_type}'")]
    UnknownDataType { data_type: String },

    #[error("failed to read config: {0}")]
    Io(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub data_types: BTreeMap<String, DataTypeConfig>,
    pub sources: BTreeMap<String, SourceConfig>,
    pub cache: CacheSettings,
    pub backoff: BackoffSettings,
    pub bulk: BulkSettings,
    pub circuit_breaker: BreakerSettings,
    pub logging: LoggingSettings,
}

/// `[data_types.<id>]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTypeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

/// One entry of `[[data_types.<id>.sources]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    pub priority: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// `[cache]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Durable store location. `None` keeps the cache in memory only.
    pub path: Option<PathBuf>,
    /// TTL for data types without a rule.
    pub default_ttl_secs: u64,
    pub ttl: BTreeMap<String, TtlRule>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            path: None,
            default_ttl_secs: 21_600,
            ttl: BTreeMap::new(),
        }
    }
}

impl CacheSettings {
    pub fn ttl_table(&self) -> TtlTable {
        self.ttl
            .iter()
            .fold(TtlTable::new(self.default_ttl_secs), |table, (id, rule)| {
                table.with_rule(id.clone(), rule.clone())
            })
    }
}

/// `[backoff]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub base_delay_ms: u64,
    pub multiplier: u32,
    pub max_delay_ms: Option<u64>,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 3_000,
            multiplier: 3,
            max_delay_ms: None,
        }
    }
}

impl BackoffSettings {
    pub fn policy(&self) -> BackoffPolicy {
        let policy = BackoffPolicy::new(Duration::from_millis(self.base_delay_ms), self.multiplier);
        match self.max_delay_ms {
            Some(ms) => policy.with_max_delay(Duration::from_millis(ms)),
            None => policy,
        }
    }
}

/// `[bulk]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkSettings {
    /// Hard cap on concurrent fetches in one batch.
    pub max_workers: usize,
    /// Misses per worker before another worker is added.
    pub keys_per_worker: usize,
    /// Upper bound on how long a batch waits for outstanding keys.
    pub batch_timeout_secs: u64,
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            max_workers: 5,
            keys_per_worker: 20,
            batch_timeout_secs: 120,
        }
    }
}

impl BulkSettings {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

/// `[circuit_breaker]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive rate-limit failures that open the breaker.
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 30 * 60,
        }
    }
}

/// `[logging]`: which fetch events are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_source_attempts: bool,
    pub log_fallback_usage: bool,
    pub log_failures: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_source_attempts: true,
            log_fallback_usage: true,
            log_failures: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    10
}

impl FeedConfig {
    /// Load and validate a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (id, data_type) in &self.data_types {
            for source in &data_type.sources {
                if source.timeout_secs == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "data type '{id}': source '{}' has a zero timeout",
                        source.name
                    )));
                }
            }
        }
        if self.bulk.max_workers == 0 {
            return Err(ConfigError::Invalid("bulk.max_workers must be at least 1".into()));
        }
        if self.bulk.keys_per_worker == 0 {
            return Err(ConfigError::Invalid(
                "bulk.keys_per_worker must be at least 1".into(),
            ));
        }
        if self.bulk.batch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "bulk.batch_timeout_secs must be at least 1".into(),
            ));
        }
        if self.backoff.multiplier == 0 {
            return Err(ConfigError::Invalid("backoff.multiplier must be at least 1".into()));
        }
        for (id, rule) in &self.cache.ttl {
            if let TtlRule::MarketHours(hours) = rule {
                if hours.open >= hours.close {
                    return Err(ConfigError::Invalid(format!(
                        "cache.ttl.{id}: session opens at {} but closes at {}",
                        hours.open, hours.close
                    )));
                }
            }
        }
        // Duplicate names and blank identifiers are checked by the registry itself.
        self.registry().map(|_| ())
    }

    /// Build the source registry, attaching each source's `[sources.<name>]` settings.
    pub fn registry(&self) -> Result<SourceRegistry, ConfigError> {
        let specs = self.data_types.iter().map(|(id, data_type)| {
            let sources = data_type
                .sources
                .iter()
                .map(|entry| {
                    let mut spec = SourceSpec::new(entry.name.clone(), entry.priority)
                        .with_timeout(Duration::from_secs(entry.timeout_secs))
                        .with_retry_count(entry.retry_count)
                        .with_config(self.sources.get(&entry.name).cloned().unwrap_or_default());
                    spec.enabled = entry.enabled;
                    spec
                })
                .collect();
            DataTypeSpec {
                id: id.clone(),
                enabled: data_type.enabled,
                sources,
            }
        });
        SourceRegistry::new(specs)
    }

    /// The built-in table for Indian equity, index, FII/DII and commodity data.
    pub fn builtin() -> Self {
        let mut data_types = BTreeMap::new();
        data_types.insert(
            "stock_prices".to_string(),
            chain(&[("yfinance", 1, 10, 2), ("nse_api", 2, 15, 1), ("bse_api", 3, 15, 1)]),
        );
        data_types.insert(
            "market_indices".to_string(),
            chain(&[("yfinance", 1, 10, 2), ("nse_api", 2, 15, 1)]),
        );
        data_types.insert(
            "fii_dii_data".to_string(),
            chain(&[("nse_api", 1, 15, 2), ("nse_website", 2, 15, 1), ("moneycontrol", 3, 10, 1)]),
        );
        data_types.insert(
            "stock_lists".to_string(),
            chain(&[("nse_csv", 1, 15, 2), ("nse_api", 2, 15, 1)]),
        );
        data_types.insert(
            "commodities".to_string(),
            chain(&[("yfinance", 1, 10, 2), ("investing_com", 2, 15, 1)]),
        );

        let mut sources = BTreeMap::new();
        sources.insert("yfinance".to_string(), SourceConfig::default());
        sources.insert(
            "nse_api".to_string(),
            session_source(
                "https://www.nseindia.com/api",
                &[("Accept", "application/json"), ("Accept-Language", "en-US,en;q=0.9")],
            ),
        );
        sources.insert(
            "nse_csv".to_string(),
            session_source(
                "https://nsearchives.nseindia.com/content/indices",
                &[("Accept", "text/csv"), ("Referer", "https://www.nseindia.com/")],
            ),
        );
        sources.insert(
            "nse_website".to_string(),
            session_source(
                "https://www.nseindia.com",
                &[("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")],
            ),
        );
        for (name, url) in [
            ("bse_api", "https://api.bseindia.com"),
            ("moneycontrol", "https://www.moneycontrol.com"),
            ("investing_com", "https://www.investing.com"),
        ] {
            sources.insert(
                name.to_string(),
                SourceConfig {
                    base_url: Some(url.to_string()),
                    headers: browser_headers(&[]),
                    ..SourceConfig::default()
                },
            );
        }

        let mut ttl = BTreeMap::new();
        for (id, secs) in [
            ("stock_prices", 21_600),
            ("market_indices", 300),
            ("fii_dii_data", 3_600),
            ("stock_lists", 86_400),
            ("commodities", 300),
        ] {
            ttl.insert(id.to_string(), TtlRule::fixed(secs));
        }

        Self {
            data_types,
            sources,
            cache: CacheSettings {
                ttl,
                ..CacheSettings::default()
            },
            ..Self::default()
        }
    }
}

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)";

fn chain(entries: &[(&str, u32, u64, u32)]) -> DataTypeConfig {
    DataTypeConfig {
        enabled: true,
        sources: entries
            .iter()
            .map(|&(name, priority, timeout_secs, retry_count)| SourceEntry {
                name: name.to_string(),
                priority,
                timeout_secs,
                retry_count,
                enabled: true,
            })
            .collect(),
    }
}

fn browser_headers(extra: &[(&str, &str)]) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert("User-Agent".to_string(), BROWSER_USER_AGENT.to_string());
    for (k, v) in extra {
        headers.insert((*k).to_string(), (*v).to_string());
    }
    headers
}

fn session_source(base_url: &str, headers: &[(&str, &str)]) -> SourceConfig {
    SourceConfig {
        base_url: Some(base_url.to_string()),
        requires_session: true,
        requires_cookies: true,
        cookie_url: Some("https://www.nseindia.com".to_string()),
        headers: browser_headers(headers),
    }
}
