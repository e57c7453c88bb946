//! Human-friendly size and duration values.
//!
//! Settings files may spell capacities as plain integers or with a `K`/`M`
//! suffix (`"10K"` = 10 240), and durations as plain milliseconds or with a
//! unit suffix (`"10s"`, `"5m"`, `"1h"`, `"1d"`, `"1w"`, `"1y"`). Both are
//! always serialized back as plain integers.

use std::fmt;
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{Result, SettingsError};

const SECOND_MS: u64 = 1000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;
const WEEK_MS: u64 = 7 * DAY_MS;
const YEAR_MS: u64 = 365 * DAY_MS;

/// Parse a size such as `"512"`, `"10K"` or `"2M"`.
pub fn parse_size(value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('K') => (&value[..value.len() - 1], 1024),
        Some('M') => (&value[..value.len() - 1], 1024 * 1024),
        _ => (value, 1),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| SettingsError::InvalidValue(format!("not a size: {value:?}")))?;
    n.checked_mul(multiplier)
        .ok_or_else(|| SettingsError::InvalidValue(format!("size overflows: {value:?}")))
}

/// Parse a duration such as `"250"`, `"10s"` or `"5m"` into milliseconds.
pub fn parse_duration_ms(value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('s') => (&value[..value.len() - 1], SECOND_MS),
        Some('m') => (&value[..value.len() - 1], MINUTE_MS),
        Some('h') => (&value[..value.len() - 1], HOUR_MS),
        Some('d') => (&value[..value.len() - 1], DAY_MS),
        Some('w') => (&value[..value.len() - 1], WEEK_MS),
        Some('y') => (&value[..value.len() - 1], YEAR_MS),
        _ => (value, 1),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| SettingsError::InvalidValue(format!("not a duration: {value:?}")))?;
    n.checked_mul(multiplier)
        .ok_or_else(|| SettingsError::InvalidValue(format!("duration overflows: {value:?}")))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    String(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Capacity
// ─────────────────────────────────────────────────────────────────────────────

/// A number of entries (cache capacity, pool size, …).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Capacity(pub usize);

impl Capacity {
    /// The raw entry count.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Capacity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0 as u64)
    }
}

impl<'de> Deserialize<'de> for Capacity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(n) => n,
            NumberOrString::String(s) => parse_size(&s).map_err(D::Error::custom)?,
        };
        usize::try_from(raw).map(Capacity).map_err(D::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Millis
// ─────────────────────────────────────────────────────────────────────────────

/// A duration stored as whole milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Millis(pub u64);

impl Millis {
    /// Convert to a [`Duration`].
    #[must_use]
    pub const fn as_duration(self) -> Duration {
        Duration::from_millis(self.0)
    }
}

impl Serialize for Millis {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for Millis {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(n) => Ok(Millis(n)),
            NumberOrString::String(s) => parse_duration_ms(&s).map(Millis).map_err(D::Error::custom),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
