//! Per-data-type TTL resolution.
//!
//! TTLs are resolved when an entry is written and stored alongside it, so a
//! rule change never retroactively expires or revives existing entries.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How long entries of one data type stay fresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TtlRule {
    /// Same TTL at all times.
    Fixed { secs: u64 },
    /// TTL depends on whether the exchange session is open.
    MarketHours(MarketHours),
}

impl TtlRule {
    pub fn fixed(secs: u64) -> Self {
        Self::Fixed { secs }
    }

    pub fn ttl_at(&self, now: DateTime<Utc>) -> u64 {
        match self {
            Self::Fixed { secs } => *secs,
            Self::MarketHours(hours) => hours.ttl_at(now),
        }
    }
}

/// Wall-clock time of day in `HH:MM` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionTime(NaiveTime);

impl SessionTime {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }
}

impl TryFrom<String> for SessionTime {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        NaiveTime::parse_from_str(value.trim(), "%H:%M")
            .map(Self)
            .map_err(|e| format!("invalid session time '{value}' (expected HH:MM): {e}"))
    }
}

impl From<SessionTime> for String {
    fn from(value: SessionTime) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SessionTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

/// Market-session aware TTL.
///
/// Short while the session is open, longer after hours on a trading day, and
/// longest on weekends and listed holidays when prices cannot move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketHours {
    /// Exchange offset from UTC in minutes (IST is +330).
    pub utc_offset_minutes: i32,
    pub open: SessionTime,
    pub close: SessionTime,
    pub open_ttl_secs: u64,
    pub closed_ttl_secs: u64,
    pub weekend_ttl_secs: u64,
    /// Exchange-local dates with no session.
    pub holidays: Vec<NaiveDate>,
}

impl Default for MarketHours {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 330,
            open: SessionTime(NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default()),
            close: SessionTime(NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default()),
            open_ttl_secs: 300,
            closed_ttl_secs: 3600,
            weekend_ttl_secs: 86_400,
            holidays: Vec::new(),
        }
    }
}

impl MarketHours {
    /// Whether `now` falls inside a trading session.
    pub fn is_session_open(&self, now: DateTime<Utc>) -> bool {
        let Some(local) = self.local_time(now) else {
            return false;
        };
        let date = local.date_naive();
        if is_weekend(date.weekday()) || self.holidays.contains(&date) {
            return false;
        }
        let time = local.time();
        self.open.0 <= time && time < self.close.0
    }

    pub fn ttl_at(&self, now: DateTime<Utc>) -> u64 {
        let Some(local) = self.local_time(now) else {
            return self.closed_ttl_secs;
        };
        let date = local.date_naive();
        if is_weekend(date.weekday()) || self.holidays.contains(&date) {
            self.weekend_ttl_secs
        } else if self.is_session_open(now) {
            self.open_ttl_secs
        } else {
            self.closed_ttl_secs
        }
    }

    fn local_time(&self, now: DateTime<Utc>) -> Option<DateTime<FixedOffset>> {
        let offset = FixedOffset::east_opt(self.utc_offset_minutes.checked_mul(60)?)?;
        Some(now.with_timezone(&offset))
    }
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

/// Data type → TTL rule, with a fallback for unlisted types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlTable {
    default_ttl_secs: u64,
    rules: BTreeMap<String, TtlRule>,
}

impl TtlTable {
    pub fn new(default_ttl_secs: u64) -> Self {
        Self {
            default_ttl_secs,
            rules: BTreeMap::new(),
        }
    }

    pub fn with_rule(mut self, data_type: impl Into<String>, rule: TtlRule) -> Self {
        self.rules.insert(data_type.into(), rule);
        self
    }

    pub fn with_fixed(self, data_type: impl Into<String>, secs: u64) -> Self {
        self.with_rule(data_type, TtlRule::fixed(secs))
    }

    /// TTL in seconds for an entry of `data_type` written at `now`.
    pub fn resolve(&self, data_type: &str, now: DateTime<Utc>) -> u64 {
        self.rules
            .get(data_type)
            .map(|rule| rule.ttl_at(now))
            .unwrap_or(self.default_ttl_secs)
    }

    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs
    }
}

impl Default for TtlTable {
    fn default() -> Self {
        Self::new(21_600)
    }
}
