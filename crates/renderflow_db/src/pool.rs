//! Database pool creation.
//!
//! Concrete `SqlitePool` (not `AnyPool`) so `#[derive(FromRow)]` keeps full
//! support for chrono and converted enum columns. Pragmas are set through
//! the connect options so every pooled connection gets them.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::info;

use crate::error::{DbError, Result};

/// Database pool type alias.
pub type DbPool = sqlx::SqlitePool;

/// Database row type for queries.
pub type DbRow = sqlx::sqlite::SqliteRow;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum connections in the pool
    pub max_connections: u32,
}

impl DbConfig {
    /// File-backed SQLite configuration.
    pub fn sqlite(path: impl AsRef<str>) -> Self {
        Self {
            url: format!("sqlite:{}?mode=rwc", path.as_ref()),
            max_connections: 5,
        }
    }

    /// In-memory SQLite configuration (for testing).
    ///
    /// Single connection: every new in-memory connection is a separate
    /// database.
    pub fn sqlite_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        }
    }

    /// Configuration from a raw sqlx URL.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
        }
    }

    /// Set maximum connections.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// Create a database pool.
///
/// WAL journaling and NORMAL sync for concurrent access, foreign keys on so
/// the job -> user and job -> content references hold.
pub async fn create_pool(config: DbConfig) -> Result<DbPool> {
    let options = SqliteConnectOptions::from_str(&config.url)
        .map_err(DbError::Sqlx)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .map_err(DbError::Sqlx)?;

    info!("Connected to database: {}", config.url);
    Ok(pool)
}
