//! # hearth-storage
//!
//! Persistence core shared by every feature of the homeserver.
//!
//! - **Caches**: bounded [`Cache`] with sequence-gated updates, single-flight
//!   [`MemoizedAccessor`] and [`BatchedMemoizedAccessor`] on top of it
//! - **Transactions**: [`TransactionRunner`] runs closures on blocking workers,
//!   retries transient failures and fires post-commit callbacks
//! - **CRUD**: [`SimpleTxn`] helpers inside a transaction, [`SqlStore`] for
//!   one-call async access
//! - **`SQLite`**: r2d2 connection pool and the [`DatabaseEngine`] capability
//!   trait
//! - **Metrics**: [`StorageMetrics`] registry and [`PerformanceCounters`]
//!
//! Log targets: `hearth_storage::sql` (statements), `hearth_storage::txn`
//! (transaction lifecycle), `hearth_storage::perf` (database-time reports).

#![deny(unsafe_code)]

pub mod cache;
pub mod errors;
pub mod metrics;
pub mod perf;
pub mod simple;
pub mod sqlite;
pub mod store;
pub mod txn;

pub use cache::{BatchedMemoizedAccessor, Cache, CacheEntry, EvictionPolicy, MemoizedAccessor};
pub use errors::{DatabaseError, ErrorKind, Result, StorageError};
pub use metrics::{MetricsSnapshot, StorageMetrics};
pub use perf::{PerformanceCounters, PerformanceSample};
pub use simple::{SimpleTxn, record};
pub use sqlite::{ConnectionConfig, DatabaseEngine, DbPool, SqliteEngine};
pub use store::SqlStore;
pub use txn::{LoggingTransaction, PostCommitCallback, Record, RetryPolicy, Rows, TransactionRunner};
