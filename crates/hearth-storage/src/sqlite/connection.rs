//! `SQLite` connection pool.
//!
//! Uses `r2d2` connection pooling with the `r2d2_sqlite` backend. The
//! [`PragmaCustomizer`] runs on each new connection (and on every
//! [`DbPool::reconnect`]) to set WAL mode, foreign keys and the performance
//! pragmas.
//!
//! In-memory pools use a uniquely named shared-cache database, so every
//! pooled connection sees the same tables.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hearth_settings::DatabaseSettings;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info};

use crate::errors::Result;

/// Alias for the underlying pool type.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// Alias for a pooled connection.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Configuration for the connection pool.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Maximum pool size (default: 10).
    pub pool_size: u32,
    /// Busy timeout in milliseconds (default: 30000).
    pub busy_timeout_ms: u32,
    /// Cache size in KiB (default: 8192 = 8 MB).
    pub cache_size_kib: i64,
    /// How long [`DbPool::get`] waits for a free connection.
    pub connection_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&DatabaseSettings::default())
    }
}

impl From<&DatabaseSettings> for ConnectionConfig {
    fn from(settings: &DatabaseSettings) -> Self {
        Self {
            pool_size: settings.pool_size,
            busy_timeout_ms: settings.busy_timeout_ms,
            cache_size_kib: settings.cache_size_kib,
            connection_timeout: settings.connection_timeout.as_duration(),
        }
    }
}

/// `SQLite` pragma customizer that runs on each new connection.
#[derive(Clone, Debug)]
struct PragmaCustomizer {
    busy_timeout_ms: u32,
    cache_size_kib: i64,
}

impl PragmaCustomizer {
    fn apply(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {};\
             PRAGMA journal_mode = WAL;\
             PRAGMA foreign_keys = ON;\
             PRAGMA cache_size = -{};\
             PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms, self.cache_size_kib
        ))
    }
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        self.apply(conn)
    }
}

#[derive(Debug)]
enum Source {
    File(PathBuf),
    SharedMemory(String),
}

/// Pool of `SQLite` connections that can re-open a connection in place.
#[derive(Clone)]
pub struct DbPool {
    pool: ConnectionPool,
    source: Arc<Source>,
    pragmas: PragmaCustomizer,
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbPool")
            .field("source", &self.source)
            .field("max_size", &self.pool.max_size())
            .finish_non_exhaustive()
    }
}

impl DbPool {
    /// Open the pool described by `settings`; `":memory:"` gives an
    /// in-memory pool.
    pub fn open(settings: &DatabaseSettings) -> Result<Self> {
        let config = ConnectionConfig::from(settings);
        if settings.path == ":memory:" {
            Self::in_memory(&config)
        } else {
            Self::file(&settings.path, &config)
        }
    }

    /// Create an in-memory pool (for testing).
    pub fn in_memory(config: &ConnectionConfig) -> Result<Self> {
        let uri = format!(
            "file:hearth-{}?mode=memory&cache=shared",
            uuid::Uuid::now_v7().simple()
        );
        Self::build(Source::SharedMemory(uri), config)
    }

    /// Create a file-backed pool.
    pub fn file(path: impl AsRef<Path>, config: &ConnectionConfig) -> Result<Self> {
        Self::build(Source::File(path.as_ref().to_path_buf()), config)
    }

    fn build(source: Source, config: &ConnectionConfig) -> Result<Self> {
        let manager = match &source {
            Source::File(path) => SqliteConnectionManager::file(path),
            Source::SharedMemory(uri) => {
                SqliteConnectionManager::file(uri).with_flags(OpenFlags::default())
            }
        };
        let pragmas = PragmaCustomizer {
            busy_timeout_ms: config.busy_timeout_ms,
            cache_size_kib: config.cache_size_kib,
        };
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(config.connection_timeout)
            .connection_customizer(Box::new(pragmas.clone()))
            .build(manager)?;
        info!(source = ?source, pool_size = config.pool_size, "database pool ready");
        Ok(Self {
            pool,
            source: Arc::new(source),
            pragmas,
        })
    }

    /// Borrow a connection, waiting up to the configured timeout.
    pub fn get(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Replace the connection behind `conn` with a freshly opened one.
    ///
    /// The new connection goes back to the pool in place of the old one.
    pub fn reconnect(&self, conn: &mut PooledConnection) -> Result<()> {
        debug!("reconnecting closed database connection");
        let fresh = match self.source.as_ref() {
            Source::File(path) => Connection::open(path)?,
            Source::SharedMemory(uri) => Connection::open_with_flags(uri, OpenFlags::default())?,
        };
        self.pragmas.apply(&fresh)?;
        **conn = fresh;
        Ok(())
    }

    /// Maximum number of connections.
    pub fn max_size(&self) -> u32 {
        self.pool.max_size()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn journal_mode(conn: &Connection) -> String {
        conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap()
    }

    fn foreign_keys(conn: &Connection) -> bool {
        conn.query_row("PRAGMA foreign_keys", [], |row| row.get::<_, i32>(0))
            .unwrap()
            == 1
    }

    #[test]
    fn in_memory_connections_share_one_database() {
        let pool = DbPool::in_memory(&ConnectionConfig::default()).unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        a.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
            .unwrap();
        let n: i64 = b.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(n, 1);
        assert!(foreign_keys(&b));
    }

    #[test]
    fn separate_in_memory_pools_are_isolated() {
        let one = DbPool::in_memory(&ConnectionConfig::default()).unwrap();
        let two = DbPool::in_memory(&ConnectionConfig::default()).unwrap();
        one.get().unwrap().execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        let exists: i64 = two
            .get()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 't'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(exists, 0);
    }

    #[test]
    fn file_pool_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::file(dir.path().join("hs.db"), &ConnectionConfig::default()).unwrap();
        let conn = pool.get().unwrap();
        assert_eq!(journal_mode(&conn), "wal");
        assert!(foreign_keys(&conn));
    }

    #[test]
    fn reconnect_keeps_data_and_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::file(dir.path().join("hs.db"), &ConnectionConfig::default()).unwrap();
        let mut conn = pool.get().unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")
            .unwrap();

        pool.reconnect(&mut conn).unwrap();
        let x: i64 = conn.query_row("SELECT x FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(x, 7);
        assert!(foreign_keys(&conn));
    }

    #[test]
    fn reconnect_in_memory_keeps_shared_database() {
        let config = ConnectionConfig {
            pool_size: 1,
            ..ConnectionConfig::default()
        };
        let pool = DbPool::in_memory(&config).unwrap();
        let mut conn = pool.get().unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        pool.reconnect(&mut conn).unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn open_from_settings() {
        let settings = DatabaseSettings {
            path: ":memory:".into(),
            pool_size: 2,
            ..DatabaseSettings::default()
        };
        let pool = DbPool::open(&settings).unwrap();
        assert_eq!(pool.max_size(), 2);
    }

    #[test]
    fn config_from_settings() {
        let config = ConnectionConfig::default();
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.busy_timeout_ms, 30_000);
        assert_eq!(config.cache_size_kib, 8192);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
    }
}
