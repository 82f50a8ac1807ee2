//! Query identity and cache key derivation.
//!
//! A query is either one symbol or a set of symbols. Sets are normalized
//! (trimmed, de-duplicated, sorted, comma-joined) so that two logically
//! identical requests always map to the same cache entry regardless of the
//! order the caller listed them in.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Separator between the data type and the normalized key in a cache key.
pub const CACHE_KEY_SEPARATOR: &str = "::";

/// A normalized fetch query.
///
/// Equality, ordering and hashing use the normalized form only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryKey {
    normalized: String,
    parts: Vec<String>,
}

impl QueryKey {
    /// A single-symbol query.
    pub fn single(symbol: impl AsRef<str>) -> Self {
        let symbol = symbol.as_ref().trim().to_string();
        Self {
            normalized: symbol.clone(),
            parts: vec![symbol],
        }
    }

    /// A set-of-symbols query. Blank entries are dropped.
    pub fn set<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parts: BTreeSet<String> = symbols
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let parts: Vec<String> = parts.into_iter().collect();
        Self {
            normalized: parts.join(","),
            parts,
        }
    }

    /// The canonical string form.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Individual symbols, sorted for sets.
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.normalized.is_empty()
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl PartialOrd for QueryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized.cmp(&other.normalized)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}

impl From<&str> for QueryKey {
    fn from(symbol: &str) -> Self {
        Self::single(symbol)
    }
}

impl From<String> for QueryKey {
    fn from(symbol: String) -> Self {
        Self::single(symbol)
    }
}

/// Composite cache key: `{data_type}::{normalized_query}`.
pub fn cache_key(data_type: &str, key: &QueryKey) -> String {
    format!("{data_type}{CACHE_KEY_SEPARATOR}{}", key.normalized())
}
