//! Storage and index engine.
//!
//! [`Index`] owns the `records` table and the inverted index derived from
//! it. Nothing else in the crate writes either; ingestion goes through
//! [`Index::upsert`] and queries through [`Index::search`].
//!
//! # Writes
//!
//! An upsert holds the lock shard for its record id (ids hash onto a
//! fixed set of async mutexes) so two writers for the same id run one
//! after the other, while writers for different ids proceed in parallel.
//! Inside that critical section:
//!
//! 1. Compare the content hash with the stored one. If they are equal the
//!    outcome is `Unchanged` and no write transaction is opened.
//! 2. `BEGIN IMMEDIATE`, read the record's current postings, and apply
//!    only the difference between old and new term frequencies. Running
//!    document-frequency and record-count counters move with it.
//!
//! No write rescans the corpus.
//!
//! # Reads
//!
//! A search opens a read transaction (a WAL snapshot), pulls the posting
//! list of each query token, accumulates scores, keeps the best
//! `page × limit` in a bounded heap, and loads only the rows of the
//! requested page. Readers never wait on writers.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::hash::{Hash, Hasher};

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Connection, QueryBuilder, Row, Sqlite, SqliteConnection};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::Config;
use crate::db::{self, DbPool};
use crate::error::{Error, Result};
use crate::migrate;
use crate::models::{format_ts_iso, Record, SearchHit, StoredRecord, UpsertOutcome};
use crate::rank::{self, Scored};
use crate::tokenize::{Analyzer, TermFrequencies};

const ANALYZER_KEY: &str = "analyzer";

/// Run `fut`, failing with [`Error::DeadlineExceeded`] once `deadline`
/// passes. The future is dropped on expiry, which releases whatever it
/// was holding.
pub(crate) async fn within<F, T>(deadline: Option<Instant>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(d) => tokio::time::timeout_at(d, fut)
            .await
            .map_err(|_| Error::DeadlineExceeded)?,
        None => fut.await,
    }
}

/// Per-record-id critical sections.
struct IdLocks {
    shards: Vec<Mutex<()>>,
}

impl IdLocks {
    fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock(&self, id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let shard = (hasher.finish() % self.shards.len() as u64) as usize;
        self.shards[shard].lock().await
    }
}

/// One page of ranked results plus the total number of matches.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedPage {
    pub hits: Vec<SearchHit>,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub records: u64,
    pub distinct_tokens: u64,
    pub postings: u64,
    pub top_tokens: Vec<(String, u64)>,
}

pub struct Index {
    pool: DbPool,
    analyzer: Analyzer,
    locks: IdLocks,
    max_limit: u32,
}

impl Index {
    /// Open the index and refuse if it was built with a different analyzer.
    pub async fn open(pool: DbPool, config: &Config) -> Result<Self> {
        let index = Self::new(pool, config);
        index.check_analyzer().await?;
        Ok(index)
    }

    /// Open without the analyzer check. Only `reindex` should need this.
    pub fn new(pool: DbPool, config: &Config) -> Self {
        Self {
            pool,
            analyzer: Analyzer::new(config.index.min_token_len),
            locks: IdLocks::new(config.index.lock_shards),
            max_limit: config.query.max_limit,
        }
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn check_analyzer(&self) -> Result<()> {
        let mut conn = self.pool.acquire_within(None).await?;
        let expected = self.analyzer.signature();
        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = ?")
                .bind(ANALYZER_KEY)
                .fetch_optional(&mut *conn)
                .await?;

        match stored {
            Some(sig) if sig == expected => Ok(()),
            Some(sig) => Err(Error::Config(format!(
                "index was built with analyzer '{}' but config gives '{}'; run `msgdex reindex`",
                sig, expected
            ))),
            None => {
                sqlx::query("INSERT OR IGNORE INTO index_meta (key, value) VALUES (?, ?)")
                    .bind(ANALYZER_KEY)
                    .bind(&expected)
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            }
        }
    }

    /// Insert, update, or skip one record.
    pub async fn upsert(&self, record: &Record, deadline: Option<Instant>) -> Result<UpsertOutcome> {
        let tf = self.analyzer.term_frequencies(&record.text);
        let hash = content_hash(record);

        let _guard = within(deadline, async {
            Ok::<_, Error>(self.locks.lock(&record.id).await)
        })
        .await?;
        let mut conn = self.pool.acquire_within(deadline).await?;

        let result = within(deadline, upsert_on(&mut conn, record, &tf, &hash)).await;
        if let Err(e) = &result {
            // The transaction may still be open on this connection.
            conn.mark_broken();
            debug!(record_id = %record.id, error = %e, "upsert failed");
        }
        result
    }

    /// Rank records against already-normalized query terms.
    ///
    /// `page` is 1-based and `limit` is clamped to `[1, max_limit]`.
    /// A page past the last match is empty, with `total` still set.
    pub async fn search(
        &self,
        terms: &BTreeSet<String>,
        page: u32,
        limit: u32,
        deadline: Option<Instant>,
    ) -> Result<RankedPage> {
        let page = page.max(1);
        let limit = limit.clamp(1, self.max_limit.max(1));
        if terms.is_empty() {
            return Ok(RankedPage {
                hits: Vec::new(),
                total: 0,
            });
        }

        let mut conn = self.pool.acquire_within(deadline).await?;
        let result = within(deadline, search_on(&mut conn, terms, page, limit)).await;
        if result.is_err() {
            conn.mark_broken();
        }
        result
    }

    pub async fn get(&self, id: &str, deadline: Option<Instant>) -> Result<Option<StoredRecord>> {
        let mut conn = self.pool.acquire_within(deadline).await?;
        within(deadline, async {
            let row = sqlx::query(
                "SELECT id, author_id, author_name, occurred_at, text, search_repr FROM records WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

            row.map(|row| -> Result<StoredRecord> {
                let repr: String = row.get("search_repr");
                Ok(StoredRecord {
                    id: row.get("id"),
                    author_id: row.get("author_id"),
                    author_name: row.get("author_name"),
                    occurred_at: format_ts_iso(row.get("occurred_at")),
                    text: row.get("text"),
                    search_representation: serde_json::from_str(&repr)?,
                })
            })
            .transpose()
        })
        .await
    }

    /// Storage reachability. Checks out a connection and pings it without
    /// reading any table.
    pub async fn ping(&self, deadline: Option<Instant>) -> Result<()> {
        let mut conn = self.pool.acquire_within(deadline).await?;
        within(deadline, async { conn.ping().await.map_err(Error::from) }).await
    }

    pub async fn stats(&self, top: u32) -> Result<IndexStats> {
        let mut conn = self.pool.acquire_within(None).await?;

        let records: i64 = sqlx::query_scalar("SELECT doc_count FROM corpus_stats WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await?
            .unwrap_or(0);
        let distinct_tokens: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM token_stats")
            .fetch_one(&mut *conn)
            .await?;
        let postings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM postings")
            .fetch_one(&mut *conn)
            .await?;
        let rows = sqlx::query(
            "SELECT token, doc_freq FROM token_stats ORDER BY doc_freq DESC, token ASC LIMIT ?",
        )
        .bind(top as i64)
        .fetch_all(&mut *conn)
        .await?;

        Ok(IndexStats {
            records: records.max(0) as u64,
            distinct_tokens: distinct_tokens.max(0) as u64,
            postings: postings.max(0) as u64,
            top_tokens: rows
                .iter()
                .map(|r| (r.get("token"), r.get::<i64, _>("doc_freq").max(0) as u64))
                .collect(),
        })
    }

    /// Rebuild postings and counters from the stored records with the
    /// current analyzer, and record it as the index's analyzer.
    ///
    /// This is the one operation that touches the whole corpus; it runs
    /// in a single write transaction.
    pub async fn reindex(&self) -> Result<u64> {
        let mut conn = self.pool.acquire_within(None).await?;
        let result = reindex_on(&mut conn, &self.analyzer).await;
        if result.is_err() {
            conn.mark_broken();
        }
        result
    }
}

/// Connect, create the schema if needed, and open the index.
///
/// The shared entry point for every CLI command and the server.
pub async fn open_index(config: &Config) -> anyhow::Result<Index> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    Ok(Index::open(pool, config).await?)
}

/// SHA-256 over every stored field, length-prefixed so field boundaries
/// cannot shift.
fn content_hash(record: &Record) -> String {
    let mut hasher = Sha256::new();
    for field in [
        record.author_id.as_bytes(),
        record.author_name.as_bytes(),
        record.text.as_bytes(),
    ] {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field);
    }
    hasher.update(record.occurred_at.timestamp_millis().to_le_bytes());
    format!("{:x}", hasher.finalize())
}

async fn upsert_on(
    conn: &mut SqliteConnection,
    record: &Record,
    tf: &TermFrequencies,
    hash: &str,
) -> Result<UpsertOutcome> {
    // Fast path: identical content needs no write lock.
    let current: Option<String> =
        sqlx::query_scalar("SELECT content_hash FROM records WHERE id = ?")
            .bind(&record.id)
            .fetch_optional(&mut *conn)
            .await?;
    if current.as_deref() == Some(hash) {
        return Ok(UpsertOutcome::Unchanged);
    }

    // Dropping `tx` on any early exit, cancellation included, rolls back.
    let mut tx = conn.begin_with("BEGIN IMMEDIATE").await?;
    let outcome = apply_upsert(&mut *tx, record, tf, hash).await?;
    if outcome == UpsertOutcome::Unchanged {
        tx.rollback().await?;
    } else {
        tx.commit().await?;
    }
    Ok(outcome)
}

async fn apply_upsert(
    conn: &mut SqliteConnection,
    record: &Record,
    tf: &TermFrequencies,
    hash: &str,
) -> Result<UpsertOutcome> {
    // Re-read under the write lock: another process may have written
    // since the fast-path check.
    let current: Option<String> =
        sqlx::query_scalar("SELECT content_hash FROM records WHERE id = ?")
            .bind(&record.id)
            .fetch_optional(&mut *conn)
            .await?;

    let repr = serde_json::to_string(tf).map_err(|e| Error::Consistency(e.to_string()))?;
    let now = chrono::Utc::now().timestamp_millis();

    let outcome = match current {
        Some(h) if h == hash => return Ok(UpsertOutcome::Unchanged),
        Some(_) => {
            sqlx::query(
                r#"
                UPDATE records
                SET author_id = ?, author_name = ?, occurred_at = ?, text = ?,
                    search_repr = ?, content_hash = ?, indexed_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&record.author_id)
            .bind(&record.author_name)
            .bind(record.occurred_at.timestamp_millis())
            .bind(&record.text)
            .bind(&repr)
            .bind(hash)
            .bind(now)
            .bind(&record.id)
            .execute(&mut *conn)
            .await?;
            UpsertOutcome::Updated
        }
        None => {
            sqlx::query(
                r#"
                INSERT INTO records (id, author_id, author_name, occurred_at, text,
                                     search_repr, content_hash, indexed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.id)
            .bind(&record.author_id)
            .bind(&record.author_name)
            .bind(record.occurred_at.timestamp_millis())
            .bind(&record.text)
            .bind(&repr)
            .bind(hash)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            sqlx::query("UPDATE corpus_stats SET doc_count = doc_count + 1 WHERE id = 1")
                .execute(&mut *conn)
                .await?;
            UpsertOutcome::Inserted
        }
    };

    // The postings table is the source of truth for what is indexed, so
    // diff against it rather than against the stored representation.
    let old: HashMap<String, u32> = sqlx::query("SELECT token, tf FROM postings WHERE record_id = ?")
        .bind(&record.id)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|r| (r.get("token"), r.get::<i64, _>("tf").max(0) as u32))
        .collect();

    for token in old.keys().filter(|t| !tf.contains_key(*t)) {
        sqlx::query("DELETE FROM postings WHERE token = ? AND record_id = ?")
            .bind(token)
            .bind(&record.id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("UPDATE token_stats SET doc_freq = doc_freq - 1 WHERE token = ?")
            .bind(token)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM token_stats WHERE token = ? AND doc_freq <= 0")
            .bind(token)
            .execute(&mut *conn)
            .await?;
    }

    for (token, &freq) in tf {
        match old.get(token) {
            Some(&prev) if prev == freq => {}
            Some(_) => {
                sqlx::query("UPDATE postings SET tf = ? WHERE token = ? AND record_id = ?")
                    .bind(freq as i64)
                    .bind(token)
                    .bind(&record.id)
                    .execute(&mut *conn)
                    .await?;
            }
            None => {
                sqlx::query("INSERT INTO postings (token, record_id, tf) VALUES (?, ?, ?)")
                    .bind(token)
                    .bind(&record.id)
                    .bind(freq as i64)
                    .execute(&mut *conn)
                    .await?;
                sqlx::query(
                    r#"
                    INSERT INTO token_stats (token, doc_freq) VALUES (?, 1)
                    ON CONFLICT(token) DO UPDATE SET doc_freq = doc_freq + 1
                    "#,
                )
                .bind(token)
                .execute(&mut *conn)
                .await?;
            }
        }
    }

    Ok(outcome)
}

async fn search_on(
    conn: &mut SqliteConnection,
    terms: &BTreeSet<String>,
    page: u32,
    limit: u32,
) -> Result<RankedPage> {
    // One read snapshot for counters, postings and rows.
    let mut tx = conn.begin().await?;
    let ranked = rank_snapshot(&mut *tx, terms, page, limit).await?;
    tx.commit().await?;
    Ok(ranked)
}

async fn rank_snapshot(
    conn: &mut SqliteConnection,
    terms: &BTreeSet<String>,
    page: u32,
    limit: u32,
) -> Result<RankedPage> {
    let doc_count: i64 = sqlx::query_scalar("SELECT doc_count FROM corpus_stats WHERE id = 1")
        .fetch_optional(&mut *conn)
        .await?
        .unwrap_or(0);

    let mut candidates: HashMap<String, Scored> = HashMap::new();

    // BTreeSet order: each record's score is summed in the same order on
    // every run, so equal inputs give bit-identical floats.
    for term in terms {
        let rows = sqlx::query(
            r#"
            SELECT p.record_id, p.tf, r.occurred_at
            FROM postings p
            JOIN records r ON r.id = p.record_id
            WHERE p.token = ?
            "#,
        )
        .bind(term)
        .fetch_all(&mut *conn)
        .await?;
        if rows.is_empty() {
            continue;
        }

        let doc_freq: Option<i64> =
            sqlx::query_scalar("SELECT doc_freq FROM token_stats WHERE token = ?")
                .bind(term)
                .fetch_optional(&mut *conn)
                .await?;
        let doc_freq = doc_freq.map(|d| d.max(0) as u64).unwrap_or(rows.len() as u64);
        let idf = rank::idf(doc_count.max(0) as u64, doc_freq);

        for row in &rows {
            let record_id: String = row.get("record_id");
            let tf = row.get::<i64, _>("tf").max(0) as u32;
            let occurred_at: i64 = row.get("occurred_at");
            candidates
                .entry(record_id)
                .or_insert_with_key(|id| Scored {
                    id: id.clone(),
                    score: 0.0,
                    occurred_at,
                })
                .score += rank::tf_weight(tf) * idf;
        }
    }

    let total = candidates.len() as u64;
    let offset = (page as usize - 1).saturating_mul(limit as usize);
    if offset as u64 >= total {
        return Ok(RankedPage {
            hits: Vec::new(),
            total,
        });
    }

    let k = offset.saturating_add(limit as usize);
    let window: Vec<Scored> = rank::top_k(candidates.into_values(), k)
        .into_iter()
        .skip(offset)
        .collect();

    let hits = load_hits(conn, &window).await?;
    Ok(RankedPage { hits, total })
}

async fn load_hits(conn: &mut SqliteConnection, window: &[Scored]) -> Result<Vec<SearchHit>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT id, author_id, author_name, occurred_at, text FROM records WHERE id IN (",
    );
    let mut ids = qb.separated(", ");
    for s in window {
        ids.push_bind(s.id.clone());
    }
    ids.push_unseparated(")");

    let rows = qb.build().fetch_all(&mut *conn).await?;
    let mut by_id: HashMap<String, sqlx::sqlite::SqliteRow> = rows
        .into_iter()
        .map(|row| (row.get::<String, _>("id"), row))
        .collect();

    window
        .iter()
        .map(|s| -> Result<SearchHit> {
            let row = by_id.remove(&s.id).ok_or_else(|| {
                Error::Consistency(format!("posting refers to missing record {}", s.id))
            })?;
            Ok(SearchHit {
                id: s.id.clone(),
                author_id: row.get("author_id"),
                author_name: row.get("author_name"),
                occurred_at: format_ts_iso(row.get("occurred_at")),
                text: row.get("text"),
                score: s.score,
            })
        })
        .collect()
}

async fn reindex_on(conn: &mut SqliteConnection, analyzer: &Analyzer) -> Result<u64> {
    let mut tx = conn.begin_with("BEGIN IMMEDIATE").await?;
    let n = rebuild(&mut *tx, analyzer).await?;
    tx.commit().await?;
    info!(records = n, "index rebuilt");
    Ok(n)
}

async fn rebuild(conn: &mut SqliteConnection, analyzer: &Analyzer) -> Result<u64> {
    sqlx::query("DELETE FROM postings").execute(&mut *conn).await?;
    sqlx::query("DELETE FROM token_stats").execute(&mut *conn).await?;

    let rows = sqlx::query("SELECT id, text FROM records ORDER BY id")
        .fetch_all(&mut *conn)
        .await?;

    for row in &rows {
        let id: String = row.get("id");
        let text: String = row.get("text");
        let tf = analyzer.term_frequencies(&text);
        let repr = serde_json::to_string(&tf).map_err(|e| Error::Consistency(e.to_string()))?;

        sqlx::query("UPDATE records SET search_repr = ? WHERE id = ?")
            .bind(&repr)
            .bind(&id)
            .execute(&mut *conn)
            .await?;
        for (token, freq) in &tf {
            sqlx::query("INSERT INTO postings (token, record_id, tf) VALUES (?, ?, ?)")
                .bind(token)
                .bind(&id)
                .bind(*freq as i64)
                .execute(&mut *conn)
                .await?;
        }
    }

    sqlx::query(
        "INSERT INTO token_stats (token, doc_freq) SELECT token, COUNT(*) FROM postings GROUP BY token",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("UPDATE corpus_stats SET doc_count = ? WHERE id = 1")
        .bind(rows.len() as i64)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO index_meta (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(ANALYZER_KEY)
    .bind(analyzer.signature())
    .execute(&mut *conn)
    .await?;

    Ok(rows.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Index) {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("idx.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let index = Index::open(pool, &config).await.unwrap();
        (tmp, index)
    }

    fn rec(id: &str, text: &str, secs: i64) -> Record {
        Record {
            id: id.to_string(),
            author_id: format!("u-{}", id),
            author_name: format!("User {}", id),
            occurred_at: Utc.timestamp_opt(secs, 0).unwrap(),
            text: text.to_string(),
        }
    }

    fn terms(index: &Index, q: &str) -> BTreeSet<String> {
        index.analyzer().query_terms(q)
    }

    #[tokio::test]
    async fn test_upsert_outcomes() {
        let (_tmp, index) = setup().await;
        let a = rec("a", "hello world", 10);

        assert_eq!(index.upsert(&a, None).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(index.upsert(&a, None).await.unwrap(), UpsertOutcome::Unchanged);

        let edited = rec("a", "goodbye world", 10);
        assert_eq!(index.upsert(&edited, None).await.unwrap(), UpsertOutcome::Updated);

        let stats = index.stats(10).await.unwrap();
        assert_eq!(stats.records, 1);
    }

    #[tokio::test]
    async fn test_update_moves_postings_incrementally() {
        let (_tmp, index) = setup().await;
        index.upsert(&rec("a", "hello world", 10), None).await.unwrap();
        index.upsert(&rec("b", "hello there", 20), None).await.unwrap();

        index.upsert(&rec("a", "farewell world world", 10), None).await.unwrap();

        let hello = index.search(&terms(&index, "hello"), 1, 10, None).await.unwrap();
        assert_eq!(hello.total, 1);
        assert_eq!(hello.hits[0].id, "b");

        let farewell = index.search(&terms(&index, "farewell"), 1, 10, None).await.unwrap();
        assert_eq!(farewell.total, 1);

        let stored = index.get("a", None).await.unwrap().unwrap();
        assert_eq!(stored.search_representation.get("world"), Some(&2));
        assert!(!stored.search_representation.contains_key("hello"));

        let stats = index.stats(10).await.unwrap();
        let hello_df = stats.top_tokens.iter().find(|(t, _)| t == "hello").map(|(_, d)| *d);
        assert_eq!(hello_df, Some(1));
        assert_eq!(stats.postings, 4); // hello,there | farewell,world
    }

    #[tokio::test]
    async fn test_metadata_only_change_is_update() {
        let (_tmp, index) = setup().await;
        index.upsert(&rec("a", "hello world", 10), None).await.unwrap();

        let mut renamed = rec("a", "hello world", 10);
        renamed.author_name = "Renamed".to_string();
        assert_eq!(index.upsert(&renamed, None).await.unwrap(), UpsertOutcome::Updated);

        let page = index.search(&terms(&index, "hello"), 1, 10, None).await.unwrap();
        assert_eq!(page.hits[0].author_name, "Renamed");
        assert_eq!(index.stats(10).await.unwrap().postings, 2);
    }

    #[tokio::test]
    async fn test_search_scenario() {
        let (_tmp, index) = setup().await;
        index.upsert(&rec("a", "hello world", 10), None).await.unwrap();
        index.upsert(&rec("b", "hello there", 20), None).await.unwrap();

        let hello = index.search(&terms(&index, "hello"), 1, 10, None).await.unwrap();
        assert_eq!(hello.total, 2);
        // Equal score: newer first.
        let ids: Vec<&str> = hello.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let world = index.search(&terms(&index, "world"), 1, 10, None).await.unwrap();
        assert_eq!(world.total, 1);
        assert_eq!(world.hits[0].id, "a");
    }

    #[tokio::test]
    async fn test_higher_term_frequency_ranks_first() {
        let (_tmp, index) = setup().await;
        index.upsert(&rec("once", "rust is fun", 50), None).await.unwrap();
        index.upsert(&rec("thrice", "rust rust rust", 10), None).await.unwrap();

        let page = index.search(&terms(&index, "rust"), 1, 10, None).await.unwrap();
        assert_eq!(page.hits[0].id, "thrice");
        assert!(page.hits[0].score > page.hits[1].score);
    }

    #[tokio::test]
    async fn test_rare_term_outweighs_common() {
        let (_tmp, index) = setup().await;
        for i in 0..5 {
            index
                .upsert(&rec(&format!("c{}", i), "common words here", i), None)
                .await
                .unwrap();
        }
        index.upsert(&rec("r", "common unicorn", 0), None).await.unwrap();
        index.upsert(&rec("s", "common common", 100), None).await.unwrap();

        let page = index
            .search(&terms(&index, "common unicorn"), 1, 10, None)
            .await
            .unwrap();
        assert_eq!(page.total, 7);
        assert_eq!(page.hits[0].id, "r");
    }

    #[tokio::test]
    async fn test_tie_break_occurred_at_then_id() {
        let (_tmp, index) = setup().await;
        index.upsert(&rec("b", "same text", 100), None).await.unwrap();
        index.upsert(&rec("a", "same text", 100), None).await.unwrap();
        index.upsert(&rec("c", "same text", 200), None).await.unwrap();

        let page = index.search(&terms(&index, "same"), 1, 10, None).await.unwrap();
        let ids: Vec<&str> = page.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_pagination_complete_and_disjoint() {
        let (_tmp, index) = setup().await;
        for i in 0..23 {
            let text = "needle ".repeat(1 + (i % 4) as usize);
            index
                .upsert(&rec(&format!("r{:02}", i), &text, i % 3), None)
                .await
                .unwrap();
        }

        let q = terms(&index, "needle");
        let first = index.search(&q, 1, 5, None).await.unwrap();
        assert_eq!(first.total, 23);

        let mut seen = Vec::new();
        for page in 1..=5 {
            let p = index.search(&q, page, 5, None).await.unwrap();
            seen.extend(p.hits.into_iter().map(|h| h.id));
        }
        assert_eq!(seen.len(), 23);
        let unique: BTreeSet<&String> = seen.iter().collect();
        assert_eq!(unique.len(), 23);

        let past = index.search(&q, 6, 5, None).await.unwrap();
        assert!(past.hits.is_empty());
        assert_eq!(past.total, 23);
    }

    #[tokio::test]
    async fn test_limit_clamped_to_max() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_db_path(tmp.path().join("idx.sqlite"));
        config.query.max_limit = 3;
        config.query.default_limit = 3;
        let pool = db::connect(&config).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let index = Index::open(pool, &config).await.unwrap();
        for i in 0..6 {
            index.upsert(&rec(&format!("r{}", i), "word", i), None).await.unwrap();
        }

        let page = index.search(&terms(&index, "word"), 1, 50, None).await.unwrap();
        assert_eq!(page.hits.len(), 3);
        assert_eq!(page.total, 6);
    }

    #[tokio::test]
    async fn test_empty_terms_short_circuit() {
        let (_tmp, index) = setup().await;
        let page = index.search(&BTreeSet::new(), 1, 10, None).await.unwrap();
        assert_eq!(page.total, 0);
        assert!(page.hits.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_same_id_upserts_stay_consistent() {
        let (_tmp, index) = setup().await;
        let index = std::sync::Arc::new(index);

        let mut handles = Vec::new();
        for i in 0..16 {
            let index = index.clone();
            handles.push(tokio::spawn(async move {
                let text = if i % 2 == 0 { "alpha beta" } else { "gamma delta" };
                index.upsert(&rec("same", text, 1), None).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let stats = index.stats(10).await.unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(stats.postings, 2);
        assert_eq!(stats.distinct_tokens, 2);
        for (_, df) in &stats.top_tokens {
            assert_eq!(*df, 1);
        }
    }

    #[tokio::test]
    async fn test_expired_deadline_aborts_and_releases() {
        let (_tmp, index) = setup().await;
        let past = Instant::now() - std::time::Duration::from_millis(1);
        let err = index
            .upsert(&rec("a", "hello", 1), Some(past))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded), "got {:?}", err);
        assert_eq!(index.pool().status().in_use, 0);
        assert_eq!(index.upsert(&rec("a", "hello", 1), None).await.unwrap(), UpsertOutcome::Inserted);
    }

    async fn setup_single_connection() -> (TempDir, Index) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_db_path(tmp.path().join("single.sqlite"));
        config.db.max_connections = 1;
        let pool = db::connect(&config).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let index = Index::open(pool, &config).await.unwrap();
        (tmp, index)
    }

    async fn seed(index: &Index, n: i64) {
        for i in 0..n {
            let text = format!("shared common words for record number{} batch", i);
            index.upsert(&rec(&format!("s{:04}", i), &text, i), None).await.unwrap();
        }
    }

    async fn stored_rows(index: &Index) -> u64 {
        let mut conn = index.pool().acquire_within(None).await.unwrap();
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        n as u64
    }

    const CANCEL_AFTER_MICROS: [u64; 9] = [0, 20, 50, 100, 250, 500, 1_000, 2_500, 5_000];

    #[tokio::test]
    async fn test_cancelled_search_does_not_poison_connection() {
        let (_tmp, index) = setup_single_connection().await;
        seed(&index, 400).await;
        let q = terms(&index, "shared common");

        for micros in CANCEL_AFTER_MICROS {
            let _ = tokio::time::timeout(
                std::time::Duration::from_micros(micros),
                index.search(&q, 1, 10, None),
            )
            .await;

            let page = index.search(&q, 1, 10, None).await.unwrap();
            assert_eq!(page.total, 400, "after cancelling at {}us", micros);
            assert_eq!(index.pool().status().in_use, 0);
        }
        index.upsert(&rec("after", "written after reads", 1), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_upsert_does_not_poison_connection() {
        let (_tmp, index) = setup_single_connection().await;
        seed(&index, 50).await;

        for (i, micros) in CANCEL_AFTER_MICROS.into_iter().enumerate() {
            let doomed = rec(&format!("c{}", i), "maybe written maybe not", i as i64);
            let _ = tokio::time::timeout(
                std::time::Duration::from_micros(micros),
                index.upsert(&doomed, None),
            )
            .await;

            let fresh = rec(&format!("n{}", i), "definitely written", i as i64);
            assert_eq!(
                index.upsert(&fresh, None).await.unwrap(),
                UpsertOutcome::Inserted,
                "after cancelling at {}us",
                micros
            );
            let q = terms(&index, "shared");
            assert_eq!(index.search(&q, 1, 10, None).await.unwrap().total, 50);
        }

        // A cancelled upsert either committed whole or not at all.
        assert_eq!(index.stats(1).await.unwrap().records, stored_rows(&index).await);
    }

    #[tokio::test]
    async fn test_aborted_tasks_release_clean_connections() {
        let (_tmp, index) = setup_single_connection().await;
        seed(&index, 200).await;
        let index = std::sync::Arc::new(index);

        for round in 0..5u64 {
            let reader = {
                let index = index.clone();
                tokio::spawn(async move {
                    let q = index.analyzer().query_terms("shared batch");
                    loop {
                        let _ = index.search(&q, 1, 10, None).await;
                    }
                })
            };
            let writer = {
                let index = index.clone();
                tokio::spawn(async move {
                    for i in 0.. {
                        let r = rec(&format!("w{}-{}", round, i), "aborted writer text", i);
                        let _ = index.upsert(&r, None).await;
                    }
                })
            };
            tokio::time::sleep(std::time::Duration::from_millis(round * 3 + 1)).await;
            reader.abort();
            writer.abort();
            let _ = reader.await;
            let _ = writer.await;

            let q = terms(&index, "shared");
            assert_eq!(index.search(&q, 1, 10, None).await.unwrap().total, 200);
            index
                .upsert(&rec(&format!("ok{}", round), "after abort", 1), None)
                .await
                .unwrap();
        }
        assert_eq!(index.stats(1).await.unwrap().records, stored_rows(&index).await);
    }

    #[tokio::test]
    async fn test_analyzer_mismatch_refused_until_reindex() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("idx.sqlite");
        let config = Config::with_db_path(&path);
        let pool = db::connect(&config).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let index = Index::open(pool.clone(), &config).await.unwrap();
        index.upsert(&rec("a", "go to the zoo", 1), None).await.unwrap();

        let mut stricter = config.clone();
        stricter.index.min_token_len = 3;
        let err = Index::open(pool.clone(), &stricter).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));

        let rebuilt = Index::new(pool.clone(), &stricter);
        assert_eq!(rebuilt.reindex().await.unwrap(), 1);
        let index = Index::open(pool, &stricter).await.unwrap();
        let go = index.search(&terms(&index, "go"), 1, 10, None).await.unwrap();
        assert_eq!(go.total, 0);
        let zoo = index.search(&terms(&index, "zoo"), 1, 10, None).await.unwrap();
        assert_eq!(zoo.total, 1);
    }

    #[tokio::test]
    async fn test_ping_does_not_need_schema() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("fresh.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        let index = Index::new(pool, &config);
        index.ping(None).await.unwrap();
    }
}
