//! Statement-logging view of an open transaction.
//!
//! Work submitted to the [`TransactionRunner`](super::TransactionRunner)
//! receives a [`LoggingTransaction`]. Every statement it runs is rewritten
//! into the engine's parameter style, logged with its bound values on the
//! `hearth_storage::sql` target, and timed into the metrics registry.

use std::collections::BTreeMap;
use std::time::Instant;

use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};
use tracing::debug;

use crate::errors::Result;
use crate::metrics::StorageMetrics;
use crate::sqlite::DatabaseEngine;

/// A row keyed by column name.
pub type Record = BTreeMap<String, Value>;

/// Closure queued with [`LoggingTransaction::call_after`].
pub type PostCommitCallback = Box<dyn FnOnce() + Send + 'static>;

/// Result set of [`LoggingTransaction::fetch`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rows {
    /// Column names in select order.
    pub columns: Vec<String>,
    /// Row values, one `Vec` per row, in column order.
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows matched.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows as column-name keyed records.
    pub fn into_records(self) -> Vec<Record> {
        let Self { columns, rows } = self;
        rows.into_iter()
            .map(|row| columns.iter().cloned().zip(row).collect())
            .collect()
    }

    /// The first column of every row.
    pub fn into_first_column(self) -> Vec<Value> {
        self.rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect()
    }
}

/// An open transaction that logs and times every statement.
pub struct LoggingTransaction<'c> {
    conn: &'c Connection,
    name: &'c str,
    engine: &'c dyn DatabaseEngine,
    metrics: &'c StorageMetrics,
    after_callbacks: Vec<PostCommitCallback>,
}

impl<'c> LoggingTransaction<'c> {
    pub(crate) fn new(
        conn: &'c Connection,
        name: &'c str,
        engine: &'c dyn DatabaseEngine,
        metrics: &'c StorageMetrics,
    ) -> Self {
        Self {
            conn,
            name,
            engine,
            metrics,
            after_callbacks: Vec::new(),
        }
    }

    /// Transaction name (`"{desc}-{id:x}"`).
    pub fn name(&self) -> &str {
        self.name
    }

    /// The engine this transaction runs on.
    pub fn engine(&self) -> &dyn DatabaseEngine {
        self.engine
    }

    /// The raw connection, for statements that need no logging.
    pub fn connection(&self) -> &Connection {
        self.conn
    }

    /// Run `callback` once this attempt commits.
    ///
    /// Callbacks run in registration order. They are discarded if the attempt
    /// rolls back, so a retried transaction registers them afresh.
    pub fn call_after<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.after_callbacks.push(Box::new(callback));
    }

    /// Run one statement and return the number of rows it changed.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        let sql = self.engine.convert_param_style(sql);
        self.log_statement(&sql, params);

        let start = Instant::now();
        let result = self
            .conn
            .prepare_cached(&sql)
            .and_then(|mut stmt| stmt.execute(params_from_iter(params)));
        self.finish_statement(&sql, start);
        Ok(result?)
    }

    /// Run one statement once per parameter row. Returns the total number of
    /// rows changed. Each row's arguments are logged as it runs.
    pub fn execute_many(&mut self, sql: &str, rows: &[Vec<Value>]) -> Result<usize> {
        let sql = self.engine.convert_param_style(sql);

        let start = Instant::now();
        let result = self.conn.prepare_cached(&sql).and_then(|mut stmt| {
            rows.iter().try_fold(0, |total, row| {
                self.log_statement(&sql, row);
                stmt.execute(params_from_iter(row)).map(|n| total + n)
            })
        });
        self.finish_statement(&sql, start);
        Ok(result?)
    }

    /// Run a query and collect every row.
    pub fn fetch(&mut self, sql: &str, params: &[Value]) -> Result<Rows> {
        let sql = self.engine.convert_param_style(sql);
        self.log_statement(&sql, params);

        let start = Instant::now();
        let result = self.conn.prepare_cached(&sql).and_then(|mut stmt| {
            let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_owned).collect();
            let width = columns.len();
            let rows = stmt
                .query_map(params_from_iter(params), |row| {
                    (0..width).map(|i| row.get::<_, Value>(i)).collect()
                })?
                .collect::<rusqlite::Result<Vec<Vec<Value>>>>()?;
            Ok(Rows { columns, rows })
        });
        self.finish_statement(&sql, start);
        Ok(result?)
    }

    pub(crate) fn into_callbacks(self) -> Vec<PostCommitCallback> {
        self.after_callbacks
    }

    fn log_statement(&self, sql: &str, params: &[Value]) {
        debug!(target: "hearth_storage::sql", txn = self.name, sql, args = ?params, "executing");
    }

    fn finish_statement(&self, sql: &str, start: Instant) {
        let elapsed = start.elapsed();
        self.metrics.record_statement(sql, elapsed);
        debug!(
            target: "hearth_storage::sql",
            txn = self.name,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "statement finished"
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
