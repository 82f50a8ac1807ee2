//! Persistent, TTL-aware cache keyed by query identity.

pub mod store;
pub mod ttl;

pub use store::{CacheEntry, CacheError, CacheStats, CacheStore, CacheWrite};
pub use ttl::{MarketHours, SessionTime, TtlRule, TtlTable};
