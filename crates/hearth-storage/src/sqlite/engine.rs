//! Capability descriptor of the database engine.
//!
//! The transaction runner and the CRUD helpers never inspect engine errors
//! or placeholder syntax directly; they ask a [`DatabaseEngine`].

use std::borrow::Cow;
use std::fmt;

use hearth_settings::{EngineSettings, ParamStyle};
use rusqlite::{Connection, ErrorCode};
use tracing::debug;

use crate::errors::{ErrorKind, Result, StorageError};

/// Engine-specific behaviour needed by the storage core.
pub trait DatabaseEngine: Send + Sync + fmt::Debug {
    /// Engine name, e.g. `"sqlite3"`.
    fn name(&self) -> &str;

    /// Rewrite `?` placeholders into the engine's parameter style.
    fn convert_param_style<'a>(&self, sql: &'a str) -> Cow<'a, str>;

    /// Whether a pooled connection has to be re-opened before use.
    fn is_connection_closed(&self, conn: &Connection) -> bool;

    /// Whether `err` is a deadlock / lock-contention failure.
    fn is_deadlock(&self, err: &StorageError) -> bool;

    /// Whether `err` means the connection went away.
    fn is_connection_lost(&self, err: &StorageError) -> bool;

    /// Transient (retry) or not. Anything the engine does not recognise
    /// keeps its own [`StorageError::kind`].
    fn classify(&self, err: &StorageError) -> ErrorKind {
        if self.is_deadlock(err) || self.is_connection_lost(err) {
            ErrorKind::Transient
        } else {
            err.kind()
        }
    }

    /// Take whatever lock makes an UPDATE-then-INSERT pair atomic.
    fn lock_table(&self, conn: &Connection, table: &str) -> Result<()>;

    /// Whether upserts should call [`lock_table`](Self::lock_table) by default.
    fn lock_on_upsert(&self) -> bool;
}

/// The `SQLite` engine.
#[derive(Clone, Debug)]
pub struct SqliteEngine {
    param_style: ParamStyle,
    lock_on_upsert: bool,
}

impl Default for SqliteEngine {
    fn default() -> Self {
        Self {
            param_style: ParamStyle::Qmark,
            lock_on_upsert: true,
        }
    }
}

impl SqliteEngine {
    /// Build from settings. Only `"sqlite3"` is accepted.
    pub fn from_settings(settings: &EngineSettings) -> Result<Self> {
        if settings.name != "sqlite3" {
            return Err(StorageError::InvalidArgument(format!(
                "unsupported database engine: {}",
                settings.name
            )));
        }
        Ok(Self {
            param_style: settings.param_style,
            lock_on_upsert: settings.lock_on_upsert,
        })
    }

    /// Placeholder spelling in use.
    pub fn param_style(&self) -> ParamStyle {
        self.param_style
    }
}

impl DatabaseEngine for SqliteEngine {
    fn name(&self) -> &str {
        "sqlite3"
    }

    fn convert_param_style<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        match self.param_style {
            ParamStyle::Qmark => Cow::Borrowed(sql),
            ParamStyle::Numbered => number_placeholders(sql),
        }
    }

    // In-process connections cannot be closed underneath us.
    fn is_connection_closed(&self, _conn: &Connection) -> bool {
        false
    }

    fn is_deadlock(&self, err: &StorageError) -> bool {
        matches!(
            err.database_error().and_then(|e| e.code),
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }

    fn is_connection_lost(&self, err: &StorageError) -> bool {
        matches!(
            err.database_error().and_then(|e| e.code),
            Some(ErrorCode::SystemIoFailure | ErrorCode::CannotOpen)
        )
    }

    fn lock_table(&self, _conn: &Connection, table: &str) -> Result<()> {
        // Writers are already serialized by the database file lock.
        debug!(table, "lock_table is a no-op on sqlite3");
        Ok(())
    }

    fn lock_on_upsert(&self) -> bool {
        self.lock_on_upsert
    }
}

/// Rewrite each `?` outside string literals and quoted identifiers into
/// `?1`, `?2`, ….
fn number_placeholders(sql: &str) -> Cow<'_, str> {
    if !sql.contains('?') {
        return Cow::Borrowed(sql);
    }
    let mut out = String::with_capacity(sql.len() + 8);
    let mut quote: Option<char> = None;
    let mut n = 0usize;
    for ch in sql.chars() {
        match (quote, ch) {
            (None, '\'' | '"' | '`') => {
                quote = Some(ch);
                out.push(ch);
            }
            (Some(q), c) if c == q => {
                quote = None;
                out.push(ch);
            }
            (None, '?') => {
                n += 1;
                out.push('?');
                out.push_str(&n.to_string());
            }
            _ => out.push(ch),
        }
    }
    Cow::Owned(out)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DatabaseError;

    fn numbered() -> SqliteEngine {
        SqliteEngine::from_settings(&EngineSettings {
            param_style: ParamStyle::Numbered,
            ..EngineSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn qmark_is_passthrough() {
        let engine = SqliteEngine::default();
        let sql = "SELECT a FROM t WHERE b = ? AND c = ?";
        assert!(matches!(engine.convert_param_style(sql), Cow::Borrowed(s) if s == sql));
    }

    #[test]
    fn numbered_rewrites_placeholders() {
        let out = numbered().convert_param_style("UPDATE t SET a = ?, b = ? WHERE c = ?");
        assert_eq!(out, "UPDATE t SET a = ?1, b = ?2 WHERE c = ?3");
    }

    #[test]
    fn numbered_skips_quoted_text() {
        let out = numbered().convert_param_style("SELECT '?' AS q, \"a?b\" FROM t WHERE x = ?");
        assert_eq!(out, "SELECT '?' AS q, \"a?b\" FROM t WHERE x = ?1");
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let err = SqliteEngine::from_settings(&EngineSettings {
            name: "postgres".into(),
            ..EngineSettings::default()
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
    }

    #[test]
    fn busy_and_locked_are_deadlocks() {
        let engine = SqliteEngine::default();
        for code in [ErrorCode::DatabaseBusy, ErrorCode::DatabaseLocked] {
            let err: StorageError = DatabaseError::new(code, "busy").into();
            assert!(engine.is_deadlock(&err));
            assert_eq!(engine.classify(&err), ErrorKind::Transient);
        }
    }

    #[test]
    fn io_failure_is_connection_lost() {
        let engine = SqliteEngine::default();
        let err: StorageError = DatabaseError::new(ErrorCode::SystemIoFailure, "disk I/O error").into();
        assert!(engine.is_connection_lost(&err));
        assert!(!engine.is_deadlock(&err));
        assert_eq!(engine.classify(&err), ErrorKind::Transient);
    }

    #[test]
    fn constraint_violation_is_fatal() {
        let engine = SqliteEngine::default();
        let err: StorageError =
            DatabaseError::new(ErrorCode::ConstraintViolation, "UNIQUE constraint failed").into();
        assert_eq!(engine.classify(&err), ErrorKind::Fatal);
    }

    #[test]
    fn non_database_errors_keep_their_kind() {
        let engine = SqliteEngine::default();
        assert_eq!(
            engine.classify(&StorageError::not_found("users")),
            ErrorKind::NotFound
        );
        assert_eq!(
            engine.classify(&StorageError::Consistency("two rows".into())),
            ErrorKind::Consistency
        );
    }

    #[test]
    fn lock_table_is_noop() {
        let engine = SqliteEngine::default();
        let conn = Connection::open_in_memory().unwrap();
        engine.lock_table(&conn, "users").unwrap();
        assert!(engine.lock_on_upsert());
        assert!(!engine.is_connection_closed(&conn));
    }
}
