//! In-process metrics registry for caches and transactions.
//!
//! A [`StorageMetrics`] is built once at startup, shared by `Arc`, and handed
//! to every cache and to the transaction runner. Instruments are created on
//! first use and live as long as the registry. Everything is lock-free on the
//! hot path except the first lookup of a new name.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

// ─────────────────────────────────────────────────────────────────────────────
// Instruments
// ─────────────────────────────────────────────────────────────────────────────

/// Monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Add one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Add `n`.
    pub fn add(&self, n: u64) {
        let _ = self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Value that can go up or down.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    /// Overwrite the value.
    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Count and cumulative duration of a timed operation.
#[derive(Debug, Default)]
pub struct Timer {
    count: AtomicU64,
    total_micros: AtomicU64,
}

impl Timer {
    /// Record one observation.
    pub fn record(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let _ = self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self.total_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all observations.
    pub fn total(&self) -> Duration {
        Duration::from_micros(self.total_micros.load(Ordering::Relaxed))
    }

    #[allow(clippy::cast_precision_loss)]
    fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            count: self.count(),
            total_ms: self.total_micros.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

/// Hit/miss/size instruments of one named cache.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Lookups that found an entry (ready or in flight).
    pub hits: Counter,
    /// Lookups that found nothing.
    pub misses: Counter,
    /// Current number of entries.
    pub size: Gauge,
}

impl CacheMetrics {
    #[allow(clippy::cast_possible_wrap)]
    pub(crate) fn set_size(&self, len: usize) {
        self.size.set(len as i64);
    }
}

/// Outcome counters of the transaction runner.
#[derive(Debug, Default)]
pub struct TxnOutcomes {
    /// Attempts that committed.
    pub commits: Counter,
    /// Attempts rolled back after a failure.
    pub rollbacks: Counter,
    /// Attempts started after a transient failure.
    pub retries: Counter,
    /// Transactions that surfaced an error to the caller.
    pub failures: Counter,
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Registry of every storage instrument.
#[derive(Debug, Default)]
pub struct StorageMetrics {
    caches: RwLock<BTreeMap<String, Arc<CacheMetrics>>>,
    statements: RwLock<BTreeMap<String, Arc<Timer>>>,
    transactions: RwLock<BTreeMap<String, Arc<Timer>>>,
    schedule: Timer,
    outcomes: TxnOutcomes,
}

impl StorageMetrics {
    /// A fresh registry behind an `Arc`.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Instruments for the named cache, created on first use.
    pub fn cache(&self, name: &str) -> Arc<CacheMetrics> {
        get_or_create(&self.caches, name)
    }

    /// Timer for statements starting with `verb` (e.g. `"SELECT"`).
    pub fn statement_timer(&self, verb: &str) -> Arc<Timer> {
        get_or_create(&self.statements, verb)
    }

    /// Timer for transactions with description `desc`.
    pub fn transaction_timer(&self, desc: &str) -> Arc<Timer> {
        get_or_create(&self.transactions, desc)
    }

    /// Record one statement; the timer is keyed by its leading keyword.
    pub fn record_statement(&self, sql: &str, elapsed: Duration) {
        self.statement_timer(&statement_verb(sql)).record(elapsed);
    }

    /// Record one transaction attempt.
    pub fn record_transaction(&self, desc: &str, elapsed: Duration) {
        self.transaction_timer(desc).record(elapsed);
    }

    /// Time between submitting work and a worker picking it up.
    pub fn schedule(&self) -> &Timer {
        &self.schedule
    }

    /// Commit/rollback/retry/failure counters.
    pub fn outcomes(&self) -> &TxnOutcomes {
        &self.outcomes
    }

    /// Point-in-time copy of every instrument.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let caches = self
            .caches
            .read()
            .iter()
            .map(|(name, m)| {
                (
                    name.clone(),
                    CacheSnapshot {
                        hits: m.hits.get(),
                        misses: m.misses.get(),
                        size: m.size.get(),
                    },
                )
            })
            .collect();
        let statements = snapshot_timers(&self.statements);
        let transactions = snapshot_timers(&self.transactions);

        MetricsSnapshot {
            caches,
            statements,
            transactions,
            schedule: self.schedule.snapshot(),
            commits: self.outcomes.commits.get(),
            rollbacks: self.outcomes.rollbacks.get(),
            retries: self.outcomes.retries.get(),
            failures: self.outcomes.failures.get(),
        }
    }
}

fn get_or_create<T: Default>(map: &RwLock<BTreeMap<String, Arc<T>>>, name: &str) -> Arc<T> {
    if let Some(existing) = map.read().get(name) {
        return Arc::clone(existing);
    }
    Arc::clone(map.write().entry(name.to_owned()).or_default())
}

fn snapshot_timers(map: &RwLock<BTreeMap<String, Arc<Timer>>>) -> BTreeMap<String, TimerSnapshot> {
    map.read()
        .iter()
        .map(|(name, t)| (name.clone(), t.snapshot()))
        .collect()
}

/// Leading keyword of a statement, upper-cased.
pub fn statement_verb(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .map_or_else(|| "UNKNOWN".to_owned(), str::to_ascii_uppercase)
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshots
// ─────────────────────────────────────────────────────────────────────────────

/// Serializable copy of a [`StorageMetrics`].
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    /// Per-cache instruments.
    pub caches: BTreeMap<String, CacheSnapshot>,
    /// Per-verb statement timers.
    pub statements: BTreeMap<String, TimerSnapshot>,
    /// Per-description transaction timers.
    pub transactions: BTreeMap<String, TimerSnapshot>,
    /// Scheduling latency.
    pub schedule: TimerSnapshot,
    /// Committed attempts.
    pub commits: u64,
    /// Rolled-back attempts.
    pub rollbacks: u64,
    /// Retried attempts.
    pub retries: u64,
    /// Failed transactions.
    pub failures: u64,
}

/// Serializable cache instruments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CacheSnapshot {
    /// Hits.
    pub hits: u64,
    /// Misses.
    pub misses: u64,
    /// Entries.
    pub size: i64,
}

/// Serializable timer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TimerSnapshot {
    /// Observations.
    pub count: u64,
    /// Cumulative milliseconds.
    pub total_ms: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_and_gauge() {
        let c = Counter::default();
        c.inc();
        c.add(4);
        assert_eq!(c.get(), 5);

        let g = Gauge::default();
        g.set(7);
        g.set(3);
        assert_eq!(g.get(), 3);
    }

    #[test]
    fn timer_accumulates() {
        let t = Timer::default();
        t.record(Duration::from_millis(2));
        t.record(Duration::from_millis(3));
        assert_eq!(t.count(), 2);
        assert_eq!(t.total(), Duration::from_millis(5));
    }

    #[test]
    fn same_name_shares_instruments() {
        let metrics = StorageMetrics::default();
        metrics.cache("get_user").hits.inc();
        metrics.cache("get_user").hits.inc();
        assert_eq!(metrics.cache("get_user").hits.get(), 2);
        assert_eq!(metrics.cache("get_event").hits.get(), 0);
    }

    #[test]
    fn verb_extraction() {
        assert_eq!(statement_verb("  select * from users"), "SELECT");
        assert_eq!(statement_verb("INSERT INTO t (a) VALUES (?)"), "INSERT");
        assert_eq!(statement_verb(""), "UNKNOWN");
    }

    #[test]
    fn snapshot_serializes() {
        let metrics = StorageMetrics::default();
        metrics.record_statement("SELECT 1", Duration::from_millis(1));
        metrics.record_transaction("get_user", Duration::from_millis(4));
        metrics.outcomes().commits.inc();
        metrics.cache("get_user").misses.inc();

        let snap = metrics.snapshot();
        assert_eq!(snap.statements["SELECT"].count, 1);
        assert_eq!(snap.commits, 1);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["caches"]["get_user"]["misses"], 1);
        assert_eq!(json["transactions"]["get_user"]["count"], 1);
        assert!((json["transactions"]["get_user"]["total_ms"].as_f64().unwrap() - 4.0).abs() < 1e-9);
    }
}
