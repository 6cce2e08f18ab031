//! SQLite connection management.
//!
//! Connections are plain `sqlx::SqliteConnection`s handed out through the
//! crate's own [`ResourcePool`] rather than `sqlx::SqlitePool`, so callers
//! get a typed [`Error::ResourceExhausted`] on pool timeout. A connection
//! that comes back still inside a transaction (its lease was dropped
//! mid-write) is closed instead of reused.
//!
//! # Write-Ahead Logging (WAL)
//!
//! WAL mode is enabled for all connections, which allows concurrent
//! readers and a single writer without blocking. Ingestion and search
//! run at the same time against the same file, so this matters.
//! A busy timeout makes a second writer wait for the first instead of
//! failing with `SQLITE_BUSY`.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection};

use crate::config::Config;
use crate::error::Result;
use crate::pool::{Manage, PoolOptions, ResourcePool};

pub type DbPool = ResourcePool<SqliteManager>;

/// Opens SQLite connections to one database file.
pub struct SqliteManager {
    options: SqliteConnectOptions,
}

impl SqliteManager {
    pub fn new(options: SqliteConnectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Manage for SqliteManager {
    type Connection = SqliteConnection;

    async fn connect(&self) -> Result<SqliteConnection> {
        Ok(self.options.connect().await?)
    }

    async fn is_alive(&self, conn: &mut SqliteConnection) -> bool {
        !conn.is_in_transaction() && conn.ping().await.is_ok()
    }

    /// A lease dropped mid-transaction has only queued its rollback, so
    /// the connection is not handed out again.
    fn is_reusable(&self, conn: &SqliteConnection) -> bool {
        !conn.is_in_transaction()
    }

    async fn close(&self, conn: SqliteConnection) {
        let _ = conn.close().await;
    }
}

/// Build a connection pool for the configured SQLite database.
///
/// - Creates the database file and parent directories if they don't exist.
/// - Enables WAL journal mode and a busy timeout on every connection.
/// - Opens one connection eagerly so a bad path fails here, not on the
///   first query.
pub async fn connect(config: &Config) -> anyhow::Result<DbPool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(config.db.busy_timeout_ms))
        .foreign_keys(true);

    let pool = ResourcePool::new(
        SqliteManager::new(options),
        PoolOptions {
            max_size: config.db.max_connections,
            acquire_timeout: config.db.acquire_timeout(),
            test_before_acquire: config.db.test_before_acquire,
        },
    );

    let conn = pool
        .acquire(config.db.acquire_timeout())
        .await
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
    pool.release(conn);

    Ok(pool)
}
