//! Async CRUD facade.
//!
//! [`SqlStore`] routes every [`SimpleTxn`] helper through the
//! [`TransactionRunner`], so each call is its own retried transaction. It also
//! hands out memoized accessors sized from the cache settings and allocates
//! stream ids.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use hearth_settings::{CacheSettings, HearthSettings, ProfilingSettings};
use rusqlite::ErrorCode;
use rusqlite::types::Value;
use tokio::task::JoinHandle;

use crate::cache::{CacheKey, CacheValue, EvictionPolicy, MemoizedAccessor};
use crate::errors::Result;
use crate::metrics::StorageMetrics;
use crate::simple::SimpleTxn;
use crate::txn::{Record, TransactionRunner};

/// Table-agnostic storage over a [`TransactionRunner`].
#[derive(Clone, Debug)]
pub struct SqlStore {
    runner: TransactionRunner,
    caches: CacheSettings,
    profiling: ProfilingSettings,
    stream_ids: Arc<AtomicI64>,
}

impl SqlStore {
    /// Wrap an existing runner.
    pub fn new(runner: TransactionRunner, caches: CacheSettings, profiling: ProfilingSettings) -> Self {
        Self {
            runner,
            caches,
            profiling,
            stream_ids: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Open the database, pool and engine described by `settings`.
    pub fn open(settings: &HearthSettings, metrics: Arc<StorageMetrics>) -> Result<Self> {
        let runner = TransactionRunner::from_settings(settings, metrics)?;
        Ok(Self::new(
            runner,
            settings.caches.clone(),
            settings.profiling.clone(),
        ))
    }

    /// The underlying transaction runner.
    pub fn runner(&self) -> &TransactionRunner {
        &self.runner
    }

    /// The shared metrics registry.
    pub fn metrics(&self) -> &Arc<StorageMetrics> {
        self.runner.metrics()
    }

    /// Start the periodic performance report if profiling is enabled.
    pub fn start_profiling(&self) -> Option<JoinHandle<()>> {
        self.profiling.enabled.then(|| {
            self.runner
                .start_profiling(self.profiling.interval.as_duration(), self.profiling.top_n)
        })
    }

    /// A memoized accessor whose capacity comes from the cache settings.
    pub fn memoized<K, V, A, F, Fut>(
        &self,
        name: &str,
        policy: EvictionPolicy,
        producer: F,
    ) -> MemoizedAccessor<K, V, A>
    where
        K: CacheKey,
        V: CacheValue,
        A: Send + 'static,
        F: Fn(K, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        MemoizedAccessor::new(
            name,
            self.caches.capacity_for(name),
            policy,
            self.metrics(),
            producer,
        )
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Insert one row.
    pub async fn insert(&self, desc: &str, table: &str, values: Record) -> Result<()> {
        let table = table.to_owned();
        self.runner
            .run_interaction(desc, move |txn| SimpleTxn::insert(txn, &table, &values))
            .await
    }

    /// Insert one row, ignoring a uniqueness or constraint violation.
    /// Returns whether the row was inserted.
    pub async fn insert_or_ignore(&self, desc: &str, table: &str, values: Record) -> Result<bool> {
        match self.insert(desc, table, values).await {
            Ok(()) => Ok(true),
            Err(err)
                if err
                    .database_error()
                    .is_some_and(|db| db.code == Some(ErrorCode::ConstraintViolation)) =>
            {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Insert many rows sharing one column set.
    pub async fn insert_many(&self, desc: &str, table: &str, rows: Vec<Record>) -> Result<()> {
        let table = table.to_owned();
        self.runner
            .run_interaction(desc, move |txn| SimpleTxn::insert_many(txn, &table, &rows))
            .await
    }

    /// Update or insert. `lock` defaults to the engine's setting when `None`.
    /// Returns whether a row was inserted.
    pub async fn upsert(
        &self,
        desc: &str,
        table: &str,
        keyvalues: Record,
        values: Record,
        insertion_values: Record,
        lock: Option<bool>,
    ) -> Result<bool> {
        let table = table.to_owned();
        let lock = lock.unwrap_or_else(|| self.runner.engine().lock_on_upsert());
        self.runner
            .run_interaction(desc, move |txn| {
                SimpleTxn::upsert(txn, &table, &keyvalues, &values, &insertion_values, lock)
            })
            .await
    }

    /// Update exactly one row.
    pub async fn update_one(
        &self,
        desc: &str,
        table: &str,
        keyvalues: Record,
        updatevalues: Record,
    ) -> Result<()> {
        let table = table.to_owned();
        self.runner
            .run_interaction(desc, move |txn| {
                SimpleTxn::update_one(txn, &table, &keyvalues, &updatevalues)
            })
            .await
    }

    /// Read `retcols` and apply `updatevalues` to the same row atomically.
    pub async fn select_update_one(
        &self,
        desc: &str,
        table: &str,
        keyvalues: Record,
        updatevalues: Record,
        retcols: &[&str],
        allow_none: bool,
    ) -> Result<Option<Record>> {
        let table = table.to_owned();
        let retcols = owned(retcols);
        self.runner
            .run_interaction(desc, move |txn| {
                SimpleTxn::select_update_one(
                    txn,
                    &table,
                    &keyvalues,
                    &updatevalues,
                    &borrowed(&retcols),
                    allow_none,
                )
            })
            .await
    }

    /// Delete exactly one row.
    pub async fn delete_one(&self, desc: &str, table: &str, keyvalues: Record) -> Result<()> {
        let table = table.to_owned();
        self.runner
            .run_interaction(desc, move |txn| SimpleTxn::delete_one(txn, &table, &keyvalues))
            .await
    }

    /// Delete every matching row; returns how many.
    pub async fn delete(&self, desc: &str, table: &str, keyvalues: Record) -> Result<usize> {
        let table = table.to_owned();
        self.runner
            .run_interaction(desc, move |txn| SimpleTxn::delete(txn, &table, &keyvalues))
            .await
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Select exactly one row.
    pub async fn select_one(
        &self,
        desc: &str,
        table: &str,
        keyvalues: Record,
        retcols: &[&str],
        allow_none: bool,
    ) -> Result<Option<Record>> {
        let table = table.to_owned();
        let retcols = owned(retcols);
        self.runner
            .run_interaction(desc, move |txn| {
                SimpleTxn::select_one(txn, &table, &keyvalues, &borrowed(&retcols), allow_none)
            })
            .await
    }

    /// First value of `retcol` among matching rows.
    pub async fn select_one_onecol(
        &self,
        desc: &str,
        table: &str,
        keyvalues: Record,
        retcol: &str,
        allow_none: bool,
    ) -> Result<Option<Value>> {
        let table = table.to_owned();
        let retcol = retcol.to_owned();
        self.runner
            .run_interaction(desc, move |txn| {
                SimpleTxn::select_one_onecol(txn, &table, &keyvalues, &retcol, allow_none)
            })
            .await
    }

    /// `retcol` of every matching row.
    pub async fn select_onecol(
        &self,
        desc: &str,
        table: &str,
        keyvalues: Record,
        retcol: &str,
    ) -> Result<Vec<Value>> {
        let table = table.to_owned();
        let retcol = retcol.to_owned();
        self.runner
            .run_interaction(desc, move |txn| {
                SimpleTxn::select_onecol(txn, &table, &keyvalues, &retcol)
            })
            .await
    }

    /// Every matching row.
    pub async fn select_list(
        &self,
        desc: &str,
        table: &str,
        keyvalues: Record,
        retcols: &[&str],
    ) -> Result<Vec<Record>> {
        let table = table.to_owned();
        let retcols = owned(retcols);
        self.runner
            .run_interaction(desc, move |txn| {
                SimpleTxn::select_list(txn, &table, &keyvalues, &borrowed(&retcols))
            })
            .await
    }

    /// Largest `id` in `table`, 0 when empty.
    pub async fn max_id(&self, desc: &str, table: &str) -> Result<i64> {
        let table = table.to_owned();
        self.runner
            .run_interaction(desc, move |txn| SimpleTxn::max_id(txn, &table))
            .await
    }

    /// Allocate the next stream id.
    ///
    /// Ids increase strictly across every clone of this store and are never
    /// handed out twice. The first id is one past the allocator's start.
    pub fn get_next_stream_id(&self) -> i64 {
        self.stream_ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Move the stream id allocator past the largest `id` in `table`.
    /// Never moves it backwards. Returns the table's largest id.
    pub async fn advance_stream_ids(&self, desc: &str, table: &str) -> Result<i64> {
        let current = self.max_id(desc, table).await?;
        let _ = self.stream_ids.fetch_max(current, Ordering::SeqCst);
        Ok(current)
    }

    /// Run a raw query in its own transaction and decode every row.
    pub async fn execute(&self, desc: &str, sql: &str, args: Vec<Value>) -> Result<Vec<Record>> {
        let sql = sql.to_owned();
        self.runner
            .run_interaction(desc, move |txn| Ok(txn.fetch(&sql, &args)?.into_records()))
            .await
    }
}

fn owned(cols: &[&str]) -> Vec<String> {
    cols.iter().map(|&c| c.to_owned()).collect()
}

fn borrowed(cols: &[String]) -> Vec<&str> {
    cols.iter().map(String::as_str).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
