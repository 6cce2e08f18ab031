//! TOML configuration.
//!
//! Every section except `[db]` has defaults, so a minimal file is:
//!
//! ```toml
//! [db]
//! path = "./data/msgdex.sqlite"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub test_before_acquire: bool,
}

fn default_max_connections() -> usize {
    8
}
fn default_acquire_timeout_ms() -> u64 {
    2_000
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_true() -> bool {
    true
}

impl DbConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_min_token_len")]
    pub min_token_len: usize,
    #[serde(default = "default_lock_shards")]
    pub lock_shards: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            min_token_len: default_min_token_len(),
            lock_shards: default_lock_shards(),
        }
    }
}

fn default_min_token_len() -> usize {
    2
}
fn default_lock_shards() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_limit")]
    pub default_limit: u32,
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,
    #[serde(default = "default_query_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_limit() -> u32 {
    10
}
fn default_max_limit() -> u32 {
    100
}
fn default_query_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages: u64,
    /// Deadline for a whole run. Unset means no run-level deadline.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_pages: default_max_pages(),
            timeout_secs: None,
        }
    }
}

impl IngestConfig {
    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, ...
    /// capped at `backoff_max_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn default_workers() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_max_pages() -> u64 {
    100_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            url: None,
            path: None,
            page_size: default_page_size(),
        }
    }
}

fn default_source_kind() -> String {
    "offset".to_string()
}
fn default_page_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Config {
    /// Config with every default and the database at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
                max_connections: default_max_connections(),
                acquire_timeout_ms: default_acquire_timeout_ms(),
                busy_timeout_ms: default_busy_timeout_ms(),
                test_before_acquire: true,
            },
            index: IndexConfig::default(),
            query: QueryConfig::default(),
            ingest: IngestConfig::default(),
            source: SourceConfig::default(),
            server: ServerConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.db.max_connections == 0 {
            bail!("db.max_connections must be >= 1");
        }
        if self.index.lock_shards == 0 {
            bail!("index.lock_shards must be >= 1");
        }
        if self.index.min_token_len == 0 {
            bail!("index.min_token_len must be >= 1");
        }
        if self.query.max_limit == 0 {
            bail!("query.max_limit must be >= 1");
        }
        if self.query.default_limit == 0 || self.query.default_limit > self.query.max_limit {
            bail!(
                "query.default_limit must be in [1, {}]",
                self.query.max_limit
            );
        }
        if self.ingest.workers == 0 {
            bail!("ingest.workers must be >= 1");
        }
        if self.source.page_size == 0 {
            bail!("source.page_size must be >= 1");
        }

        match self.source.kind.as_str() {
            "offset" | "cursor" | "jsonl" => {}
            other => bail!(
                "Unknown source kind: '{}'. Must be offset, cursor, or jsonl.",
                other
            ),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
