//! Schema creation.
//!
//! | Table | Holds |
//! |-------|-------|
//! | `records` | one row per record id, with its serialized token weights |
//! | `postings` | inverted index: term frequency per (token, record id) |
//! | `token_stats` | running document frequency per token |
//! | `corpus_stats` | running record count (single row) |
//! | `index_meta` | analyzer signature and other key/value metadata |
//!
//! Every statement is idempotent, so running migrations twice is safe.

use sqlx::SqliteConnection;

use crate::db::DbPool;
use crate::error::Result;

pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    let mut conn = pool.acquire_within(None).await?;
    create_schema(&mut conn).await
}

async fn create_schema(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            author_id TEXT NOT NULL,
            author_name TEXT NOT NULL,
            occurred_at INTEGER NOT NULL,
            text TEXT NOT NULL,
            search_repr TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    // Keyed by token first so a term lookup is a prefix range scan.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS postings (
            token TEXT NOT NULL,
            record_id TEXT NOT NULL,
            tf INTEGER NOT NULL,
            PRIMARY KEY (token, record_id),
            FOREIGN KEY (record_id) REFERENCES records(id)
        ) WITHOUT ROWID
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS token_stats (
            token TEXT PRIMARY KEY,
            doc_freq INTEGER NOT NULL
        ) WITHOUT ROWID
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS corpus_stats (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            doc_count INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO corpus_stats (id, doc_count) VALUES (1, 0)")
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_postings_record_id ON postings(record_id)")
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_occurred_at ON records(occurred_at DESC)",
    )
    .execute(&mut *conn)
    .await?;

    Ok(())
}
