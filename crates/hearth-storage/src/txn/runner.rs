//! Retrying transaction executor.
//!
//! Each submission runs on a blocking worker with one pooled connection:
//!
//! ```text
//! START -> EXECUTING -> COMMIT -> DONE
//!              |
//!              +-> transient error -> ROLLED_BACK -> retry (up to max_attempts)
//!              |                                  -> FAIL
//!              +-> any other error  -> ROLLED_BACK -> FAIL
//! ```
//!
//! Post-commit callbacks of the committed attempt run on the worker once the
//! connection is back in the pool and before the result is delivered.
//!
//! At most `pool.max_size()` submissions hold a worker at once. The rest
//! queue on a semaphore instead of timing out on the pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hearth_settings::{HearthSettings, TransactionSettings};
use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::logging::{LoggingTransaction, PostCommitCallback};
use crate::errors::{ErrorKind, Result, StorageError};
use crate::metrics::StorageMetrics;
use crate::perf::PerformanceCounters;
use crate::sqlite::{DatabaseEngine, DbPool, PooledConnection, SqliteEngine};

const TXN_TARGET: &str = "hearth_storage::txn";

// ─────────────────────────────────────────────────────────────────────────────
// Retry policy
// ─────────────────────────────────────────────────────────────────────────────

/// How often and how patiently transient failures are retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per transaction, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&TransactionSettings::default())
    }
}

impl From<&TransactionSettings> for RetryPolicy {
    fn from(settings: &TransactionSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: settings.retry_base_delay.as_duration(),
            max_delay: settings.retry_max_delay.as_duration(),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based): exponential
    /// from `base_delay`, capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Profile {
    counters: PerformanceCounters,
    total: Duration,
    reported: Duration,
}

struct Inner {
    pool: DbPool,
    engine: Arc<dyn DatabaseEngine>,
    metrics: Arc<StorageMetrics>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    next_id: AtomicU64,
    profile: Mutex<Profile>,
}

/// Runs closures inside database transactions on blocking workers.
#[derive(Clone)]
pub struct TransactionRunner {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TransactionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRunner")
            .field("pool", &self.inner.pool)
            .field("engine", &self.inner.engine)
            .field("retry", &self.inner.retry)
            .finish_non_exhaustive()
    }
}

impl TransactionRunner {
    /// Create a runner over `pool`.
    pub fn new(
        pool: DbPool,
        engine: Arc<dyn DatabaseEngine>,
        metrics: Arc<StorageMetrics>,
        retry: RetryPolicy,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(pool.max_size() as usize));
        Self {
            inner: Arc::new(Inner {
                pool,
                engine,
                metrics,
                retry,
                permits,
                next_id: AtomicU64::new(0),
                profile: Mutex::new(Profile::default()),
            }),
        }
    }

    /// Open the pool and engine described by `settings`.
    ///
    /// Settings that fail validation are rejected with
    /// [`StorageError::InvalidArgument`] before anything is opened.
    pub fn from_settings(settings: &HearthSettings, metrics: Arc<StorageMetrics>) -> Result<Self> {
        settings
            .validate()
            .map_err(|err| StorageError::InvalidArgument(err.to_string()))?;
        let pool = DbPool::open(&settings.database)?;
        let engine = SqliteEngine::from_settings(&settings.engine)?;
        Ok(Self::new(
            pool,
            Arc::new(engine),
            metrics,
            RetryPolicy::from(&settings.transactions),
        ))
    }

    /// The engine transactions run on.
    pub fn engine(&self) -> &Arc<dyn DatabaseEngine> {
        &self.inner.engine
    }

    /// The shared metrics registry.
    pub fn metrics(&self) -> &Arc<StorageMetrics> {
        &self.inner.metrics
    }

    /// The connection pool.
    pub fn pool(&self) -> &DbPool {
        &self.inner.pool
    }

    /// Run `work` inside a transaction named after `desc`.
    ///
    /// `work` may be called more than once: a transient failure rolls the
    /// attempt back and calls it again on a fresh transaction. Callbacks it
    /// registers with [`LoggingTransaction::call_after`] run once, after the
    /// successful attempt commits. Errors come back wrapped in
    /// [`StorageError::Transaction`].
    pub async fn run_interaction<T, F>(&self, desc: &str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut(&mut LoggingTransaction<'_>) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let desc = desc.to_owned();
        let submitted = Instant::now();
        let permit = self.acquire().await?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            inner.run_interaction(&desc, submitted, work)
        })
        .await
        .unwrap_or_else(|err| Err(StorageError::Worker(err.to_string())))
    }

    /// Run `f` with a raw pooled connection: no transaction, no retries.
    pub async fn run_with_connection<T, F>(&self, desc: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let desc = desc.to_owned();
        let submitted = Instant::now();
        let permit = self.acquire().await?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            inner.metrics.schedule().record(submitted.elapsed());
            let mut conn = inner.checkout()?;
            let start = Instant::now();
            let result = f(&mut conn);
            inner.metrics.record_transaction(&desc, start.elapsed());
            result
        })
        .await
        .unwrap_or_else(|err| Err(StorageError::Worker(err.to_string())))
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|err| StorageError::Worker(err.to_string()))
    }

    /// One line summarising database time since the previous report:
    /// overall share of `interval`, then the `limit` busiest descriptions.
    pub fn performance_report(&self, interval: Duration, limit: usize) -> String {
        let mut profile = self.inner.profile.lock();
        let spent = profile.total.saturating_sub(profile.reported);
        profile.reported = profile.total;
        let ratio = if interval.is_zero() {
            0.0
        } else {
            spent.as_secs_f64() / interval.as_secs_f64()
        };
        let top = profile.counters.interval(interval, limit);
        format!("Total database time: {:.3}% {{{top}}}", ratio * 100.0)
    }

    /// Log [`performance_report`](Self::performance_report) every
    /// `interval` on the `hearth_storage::perf` target until the handle is
    /// aborted.
    pub fn start_profiling(&self, interval: Duration, limit: usize) -> JoinHandle<()> {
        let runner = self.clone();
        let period = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last = ticker.tick().await;
            loop {
                let now = ticker.tick().await;
                let report = runner.performance_report(now - last, limit);
                last = now;
                info!(target: "hearth_storage::perf", "{report}");
            }
        })
    }
}

impl Inner {
    fn checkout(&self) -> Result<PooledConnection> {
        let mut conn = self.pool.get()?;
        if self.engine.is_connection_closed(&conn) {
            self.pool.reconnect(&mut conn)?;
        }
        Ok(conn)
    }

    fn run_interaction<T, F>(&self, desc: &str, submitted: Instant, mut work: F) -> Result<T>
    where
        F: FnMut(&mut LoggingTransaction<'_>) -> Result<T>,
    {
        self.metrics.schedule().record(submitted.elapsed());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{desc}-{id:x}");

        let outcome = match self.checkout() {
            Ok(mut conn) => self.run_attempts(desc, &name, &mut conn, &mut work),
            Err(err) => Err(StorageError::Transaction {
                name: name.clone(),
                transient: false,
                source: Box::new(err),
            }),
        };
        // The connection is back in the pool from here on.

        match outcome {
            Ok((value, callbacks)) => {
                for callback in callbacks {
                    callback();
                }
                Ok(value)
            }
            Err(err) => {
                self.metrics.outcomes().failures.inc();
                debug!(target: TXN_TARGET, txn = %name, error = %err, "transaction failed");
                Err(err)
            }
        }
    }

    fn run_attempts<T, F>(
        &self,
        desc: &str,
        name: &str,
        conn: &mut Connection,
        work: &mut F,
    ) -> Result<(T, Vec<PostCommitCallback>)>
    where
        F: FnMut(&mut LoggingTransaction<'_>) -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            debug!(target: TXN_TARGET, txn = name, attempt, "transaction started");
            let start = Instant::now();
            let result = self.attempt(name, conn, work);
            let elapsed = start.elapsed();
            self.record_attempt(desc, elapsed);

            let err = match result {
                Ok(done) => {
                    self.metrics.outcomes().commits.inc();
                    debug!(
                        target: TXN_TARGET,
                        txn = name,
                        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                        "transaction committed"
                    );
                    return Ok(done);
                }
                Err(err) => err,
            };

            let transient = self.engine.classify(&err) == ErrorKind::Transient;
            if transient && attempt < self.retry.max_attempts {
                if self.engine.is_deadlock(&err) {
                    warn!(target: TXN_TARGET, txn = name, attempt, error = %err, "deadlock, retrying transaction");
                } else {
                    warn!(target: TXN_TARGET, txn = name, attempt, error = %err, "transient database error, retrying transaction");
                }
                self.metrics.outcomes().retries.inc();
                std::thread::sleep(self.retry.delay(attempt));
                attempt += 1;
                continue;
            }

            if transient {
                warn!(target: TXN_TARGET, txn = name, attempts = attempt, error = %err, "giving up on transaction");
            }
            return Err(StorageError::Transaction {
                name: name.to_owned(),
                transient,
                source: Box::new(err),
            });
        }
    }

    fn attempt<T, F>(
        &self,
        name: &str,
        conn: &mut Connection,
        work: &mut F,
    ) -> Result<(T, Vec<PostCommitCallback>)>
    where
        F: FnMut(&mut LoggingTransaction<'_>) -> Result<T>,
    {
        let tx = conn.transaction()?;
        let mut txn = LoggingTransaction::new(&tx, name, self.engine.as_ref(), &self.metrics);

        match work(&mut txn) {
            Ok(value) => {
                let callbacks = txn.into_callbacks();
                if let Err(err) = tx.commit() {
                    self.metrics.outcomes().rollbacks.inc();
                    return Err(err.into());
                }
                Ok((value, callbacks))
            }
            Err(err) => {
                drop(txn);
                if let Err(rollback_err) = tx.rollback() {
                    warn!(target: TXN_TARGET, txn = name, error = %rollback_err, "failed to roll back transaction");
                }
                self.metrics.outcomes().rollbacks.inc();
                Err(err)
            }
        }
    }

    fn record_attempt(&self, desc: &str, elapsed: Duration) {
        {
            let mut profile = self.profile.lock();
            profile.counters.update(desc, elapsed);
            profile.total += elapsed;
        }
        self.metrics.record_transaction(desc, elapsed);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
