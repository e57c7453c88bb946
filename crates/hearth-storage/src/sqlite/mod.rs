//! `SQLite` connection pooling and engine capabilities.

pub mod connection;
pub mod engine;

pub use connection::{ConnectionConfig, ConnectionPool, DbPool, PooledConnection};
pub use engine::{DatabaseEngine, SqliteEngine};
