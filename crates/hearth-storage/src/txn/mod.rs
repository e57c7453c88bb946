//! Transaction execution.
//!
//! - [`TransactionRunner`]: retrying executor on blocking workers
//! - [`LoggingTransaction`]: the statement-logging handle work receives

pub mod logging;
pub mod runner;

pub use logging::{LoggingTransaction, PostCommitCallback, Record, Rows};
pub use runner::{RetryPolicy, TransactionRunner};
