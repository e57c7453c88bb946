//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so partial JSON is accepted and missing fields take their production
//! default.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};
use crate::units::{Capacity, Millis};

/// Root settings for the storage core.
///
/// ```json
/// {
///   "database": { "path": "/var/lib/hearth/homeserver.db", "poolSize": 8 },
///   "caches": { "eventCacheSize": "20K", "perCache": { "get_user": 5000 } },
///   "profiling": { "enabled": true, "interval": "30s" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HearthSettings {
    /// Database file and connection pool.
    pub database: DatabaseSettings,
    /// Capability descriptor of the database engine.
    pub engine: EngineSettings,
    /// Cache capacities.
    pub caches: CacheSettings,
    /// Transaction retry budget.
    pub transactions: TransactionSettings,
    /// Periodic database-time reporting.
    pub profiling: ProfilingSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl HearthSettings {
    /// Reject values the storage core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.database.pool_size == 0 {
            return Err(SettingsError::InvalidValue(
                "database.poolSize must be at least 1".into(),
            ));
        }
        if self.transactions.max_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "transactions.maxAttempts must be at least 1".into(),
            ));
        }
        if self.caches.default_max_entries.get() == 0 {
            return Err(SettingsError::InvalidValue(
                "caches.defaultMaxEntries must be at least 1".into(),
            ));
        }
        if self.caches.event_cache_size.get() == 0 {
            return Err(SettingsError::InvalidValue(
                "caches.eventCacheSize must be at least 1".into(),
            ));
        }
        if let Some((name, _)) = self.caches.per_cache.iter().find(|(_, c)| c.get() == 0) {
            return Err(SettingsError::InvalidValue(format!(
                "caches.perCache.{name} must be at least 1"
            )));
        }
        if self.profiling.enabled && self.profiling.interval.0 == 0 {
            return Err(SettingsError::InvalidValue(
                "profiling.interval must be non-zero when profiling is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Database file and pool sizing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// Path of the `SQLite` database, or `":memory:"`.
    pub path: String,
    /// Maximum number of pooled connections.
    pub pool_size: u32,
    /// `SQLite` busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Page cache size per connection in KiB.
    pub cache_size_kib: i64,
    /// How long a borrow waits for a free connection.
    pub connection_timeout: Millis,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "homeserver.db".to_string(),
            pool_size: 10,
            busy_timeout_ms: 30_000,
            cache_size_kib: 8192,
            connection_timeout: Millis(5_000),
        }
    }
}

/// How bound parameters are spelled in SQL text handed to the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamStyle {
    /// Anonymous `?` placeholders, passed through unchanged.
    #[default]
    Qmark,
    /// Positional `?1`, `?2`, … placeholders.
    Numbered,
}

/// Capabilities of the configured database engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Engine name (only `"sqlite3"` ships).
    pub name: String,
    /// Placeholder spelling the engine expects.
    pub param_style: ParamStyle,
    /// Whether upserts lock the table before the UPDATE/INSERT pair.
    pub lock_on_upsert: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            name: "sqlite3".to_string(),
            param_style: ParamStyle::Qmark,
            lock_on_upsert: true,
        }
    }
}

/// Cache capacities.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    /// Capacity for caches without an explicit override.
    pub default_max_entries: Capacity,
    /// Capacity of the event cache.
    pub event_cache_size: Capacity,
    /// Per-cache overrides keyed by cache name.
    pub per_cache: BTreeMap<String, Capacity>,
}

impl CacheSettings {
    /// Capacity for the named cache, falling back to the default.
    #[must_use]
    pub fn capacity_for(&self, name: &str) -> usize {
        self.per_cache
            .get(name)
            .copied()
            .unwrap_or(self.default_max_entries)
            .get()
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_max_entries: Capacity(1000),
            event_cache_size: Capacity(10 * 1024),
            per_cache: BTreeMap::new(),
        }
    }
}

/// Transaction retry budget.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionSettings {
    /// Total attempts per transaction, including the first.
    pub max_attempts: u32,
    /// Base delay before a retry; doubled for each further retry.
    pub retry_base_delay: Millis,
    /// Upper bound on a single retry delay.
    pub retry_max_delay: Millis,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_base_delay: Millis(10),
            retry_max_delay: Millis(250),
        }
    }
}

/// Periodic "total database time" report.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfilingSettings {
    /// Whether the report loop runs.
    pub enabled: bool,
    /// Report interval.
    pub interval: Millis,
    /// Number of transaction categories listed per report.
    pub top_n: usize,
}

impl Default for ProfilingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Millis(10_000),
            top_n: 3,
        }
    }
}

/// Log output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
