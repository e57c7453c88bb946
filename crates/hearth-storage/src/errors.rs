//! Error types for the storage core.
//!
//! [`StorageError`] is `Clone` so that a single failed fetch can be handed to
//! every caller waiting on it. Database failures are therefore captured as a
//! [`DatabaseError`] value (code + message) rather than by wrapping the
//! non-cloneable `rusqlite::Error`.

use std::fmt;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Coarse classification of a [`StorageError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Expected exactly one row, found none.
    NotFound,
    /// A uniqueness or shape invariant was violated. Never retried.
    Consistency,
    /// Lost connection or deadlock; retried by the transaction runner.
    Transient,
    /// Any other failure. Surfaced immediately.
    Fatal,
    /// Consistency-check mode found a cached value that differs from the store.
    StaleCache,
}

/// A failure reported by the database engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseError {
    /// Primary result code, when the failure came from `SQLite` itself.
    pub code: Option<ErrorCode>,
    /// Extended result code, when available.
    pub extended_code: Option<i32>,
    /// Human-readable message.
    pub message: String,
}

impl DatabaseError {
    /// A failure carrying an engine result code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            extended_code: None,
            message: message.into(),
        }
    }

    /// A failure without an engine result code (e.g. a type conversion).
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            code: None,
            extended_code: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({code:?})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for DatabaseError {}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(failure, message) => Self {
                code: Some(failure.code),
                extended_code: Some(failure.extended_code),
                message: message.unwrap_or_else(|| failure.to_string()),
            },
            other => Self::other(other.to_string()),
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Clone, Debug, Error)]
pub enum StorageError {
    /// No row matched a predicate that had to match exactly one.
    #[error("no row found in {table}")]
    NotFound {
        /// Table that was queried.
        table: String,
    },

    /// More than one row matched a predicate that had to be unique.
    #[error("consistency error: {0}")]
    Consistency(String),

    /// The caller passed arguments that cannot form a valid statement.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The database engine rejected a statement or lost its connection.
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// No connection could be borrowed from the pool.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// A blocking worker panicked or was shut down.
    #[error("storage worker failed: {0}")]
    Worker(String),

    /// A cached value disagreed with a fresh read (consistency-check mode).
    #[error("stale cache entry in {cache} for {key}")]
    StaleCache {
        /// Cache name.
        cache: String,
        /// Debug rendering of the key.
        key: String,
    },

    /// A failure annotated with the transaction it surfaced from.
    #[error("[{name}] {source}")]
    Transaction {
        /// Transaction name (`"{desc}-{id:x}"`).
        name: String,
        /// Whether the engine classified the failure as transient.
        transient: bool,
        /// The original failure, unchanged.
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Shorthand for [`StorageError::NotFound`].
    pub fn not_found(table: &str) -> Self {
        Self::NotFound {
            table: table.to_owned(),
        }
    }

    /// Classify this error, looking through transaction annotations.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Consistency(_) | Self::InvalidArgument(_) => ErrorKind::Consistency,
            Self::Database(_) | Self::Pool(_) | Self::Worker(_) => ErrorKind::Fatal,
            Self::StaleCache { .. } => ErrorKind::StaleCache,
            Self::Transaction {
                transient, source, ..
            } => match source.kind() {
                ErrorKind::Fatal if *transient => ErrorKind::Transient,
                kind => kind,
            },
        }
    }

    /// The original error beneath any transaction annotations.
    pub fn root(&self) -> &StorageError {
        match self {
            Self::Transaction { source, .. } => source.root(),
            other => other,
        }
    }

    /// The database failure beneath any annotations, if this is one.
    pub fn database_error(&self) -> Option<&DatabaseError> {
        match self.root() {
            Self::Database(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.into())
    }
}

impl From<r2d2::Error> for StorageError {
    fn from(err: r2d2::Error) -> Self {
        Self::Pool(err.to_string())
    }
}

/// Convenience type alias for storage results.
pub type Result<T> = std::result::Result<T, StorageError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
