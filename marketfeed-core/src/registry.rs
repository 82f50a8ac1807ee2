//! Source registry: which upstream sources serve each data type, and in what order.
//!
//! The registry is built once at startup from [`FeedConfig`](crate::config::FeedConfig)
//! (or directly from specs in tests) and is read-only afterwards.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Source-level settings shared by every data type that uses the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Root URL for HTTP-backed sources. `None` for library-backed ones.
    pub base_url: Option<String>,
    /// A warm-up request must be made before the first real request.
    pub requires_session: bool,
    /// Cookies returned by the warm-up request must be replayed.
    pub requires_cookies: bool,
    /// URL hit by the warm-up request.
    pub cookie_url: Option<String>,
    /// Headers sent with every request.
    pub headers: BTreeMap<String, String>,
}

/// One upstream source as configured for a particular data type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub name: String,
    /// Lower is tried first.
    pub priority: u32,
    pub timeout: Duration,
    /// Extra attempts after the first one.
    pub retry_count: u32,
    pub enabled: bool,
    pub config: SourceConfig,
}

impl SourceSpec {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
            timeout: Duration::from_secs(10),
            retry_count: 0,
            enabled: true,
            config: SourceConfig::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_config(mut self, config: SourceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Total attempts the orchestrator makes against this source.
    pub fn attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }
}

/// A named category of fetchable data and its fallback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTypeSpec {
    pub id: String,
    pub enabled: bool,
    /// Sources in configuration order (not yet sorted by priority).
    pub sources: Vec<SourceSpec>,
}

impl DataTypeSpec {
    pub fn new(id: impl Into<String>, sources: Vec<SourceSpec>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            sources,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Lookup table from data type identifier to its spec.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    data_types: BTreeMap<String, DataTypeSpec>,
}

impl SourceRegistry {
    /// Build a registry, rejecting blank identifiers and duplicate names.
    pub fn new(specs: impl IntoIterator<Item = DataTypeSpec>) -> Result<Self, ConfigError> {
        let mut data_types = BTreeMap::new();

        for spec in specs {
            if spec.id.trim().is_empty() {
                return Err(ConfigError::Invalid("data type identifier is blank".into()));
            }

            let mut seen = HashSet::new();
            for source in &spec.sources {
                if source.name.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "data type '{}' has a source with a blank name",
                        spec.id
                    )));
                }
                if !seen.insert(source.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "data type '{}' lists source '{}' more than once",
                        spec.id, source.name
                    )));
                }
            }

            let id = spec.id.clone();
            if data_types.insert(id.clone(), spec).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "data type '{id}' is defined more than once"
                )));
            }
        }

        Ok(Self { data_types })
    }

    /// Enabled sources for a data type, ascending by priority, stable on ties.
    ///
    /// A disabled data type yields an empty list. An identifier that was never
    /// configured is a [`ConfigError::UnknownDataType`].
    pub fn sources_for(&self, data_type: &str) -> Result<Vec<SourceSpec>, ConfigError> {
        let spec = self.lookup(data_type)?;
        if !spec.enabled {
            return Ok(Vec::new());
        }

        let mut sources: Vec<SourceSpec> =
            spec.sources.iter().filter(|s| s.enabled).cloned().collect();
        // sort_by_key is stable, so equal priorities keep config order
        sources.sort_by_key(|s| s.priority);
        Ok(sources)
    }

    /// Names of the enabled sources in the order they will be tried.
    pub fn enabled_sources(&self, data_type: &str) -> Result<Vec<String>, ConfigError> {
        Ok(self
            .sources_for(data_type)?
            .into_iter()
            .map(|s| s.name)
            .collect())
    }

    pub fn is_source_enabled(&self, data_type: &str, source: &str) -> bool {
        self.enabled_sources(data_type)
            .map(|names| names.iter().any(|n| n == source))
            .unwrap_or(false)
    }

    pub fn get(&self, data_type: &str) -> Option<&DataTypeSpec> {
        self.data_types.get(data_type)
    }

    /// Configured data type identifiers, sorted.
    pub fn data_types(&self) -> impl Iterator<Item = &str> {
        self.data_types.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.data_types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_types.is_empty()
    }

    fn lookup(&self, data_type: &str) -> Result<&DataTypeSpec, ConfigError> {
        self.data_types
            .get(data_type)
            .ok_or_else(|| ConfigError::UnknownDataType {
                data_type: data_type.to_string(),
            })
    }
}
