//! Ingestion coordinator.
//!
//! Drives a [`PageSource`] from its first page to end of stream and feeds
//! every item through validation and [`Index::upsert`], at most `workers`
//! upserts at a time. A page fetch that fails transiently is retried with
//! backoff a bounded number of times before the run gives up.
//!
//! The cursor lives only for the duration of a run. Every run starts at
//! the beginning of the source and relies on idempotent upsert, so pages
//! seen twice (a retry that overlaps, or a second run) only add to
//! `duplicates`.
//!
//! Failures are scoped:
//! - a malformed item, or a storage failure on one item, counts as
//!   `failed` and the run continues;
//! - a page that cannot be fetched within the retry budget ends the run
//!   with [`Error::FetchExhausted`], naming the cursor it stopped at;
//! - the run deadline ends the run with [`Error::DeadlineExceeded`].

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Config, IngestConfig};
use crate::error::{Error, Result};
use crate::index::{open_index, Index};
use crate::models::{parse_record, IngestSummary, Page};
use crate::source::{CursorSource, JsonlSource, OffsetSource, PageSource};

pub struct Ingestor<S: PageSource> {
    source: S,
    index: Arc<Index>,
    config: IngestConfig,
}

impl<S: PageSource> Ingestor<S> {
    pub fn new(source: S, index: Arc<Index>, config: &IngestConfig) -> Self {
        Self {
            source,
            index,
            config: config.clone(),
        }
    }

    /// Run to end of stream under the configured run timeout, if any.
    pub async fn run(&self) -> Result<IngestSummary> {
        let deadline = self
            .config
            .timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        self.run_until(deadline).await
    }

    pub async fn run_until(&self, deadline: Option<Instant>) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();
        let mut state = self.source.start();
        let mut pages = 0u64;

        info!(source = %self.source.describe(), "ingestion started");

        loop {
            if pages >= self.config.max_pages {
                warn!(
                    cursor = %state,
                    max_pages = self.config.max_pages,
                    "page limit reached, stopping"
                );
                break;
            }

            let page = self.fetch_with_retry(&state, deadline).await?;
            pages += 1;
            summary.fetched += page.items.len() as u64;

            if page.items.is_empty() {
                break;
            }
            self.apply_page(&page.items, &mut summary, deadline).await?;
            debug!(cursor = %state, items = page.items.len(), "page applied");

            match page.next {
                Some(next) => state = next,
                None => break,
            }
        }

        info!(
            pages,
            fetched = summary.fetched,
            inserted = summary.inserted,
            updated = summary.updated,
            duplicates = summary.duplicates,
            failed = summary.failed,
            "ingestion finished"
        );
        Ok(summary)
    }

    /// Fetch one page, retrying transient failures with exponential backoff.
    async fn fetch_with_retry(
        &self,
        state: &S::State,
        deadline: Option<Instant>,
    ) -> Result<Page<S::State>> {
        let attempts = self.config.max_retries + 1;
        let mut last = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = self.config.backoff(attempt - 1);
                if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                    return Err(Error::DeadlineExceeded);
                }
                tokio::time::sleep(delay).await;
            }

            let per_attempt = Instant::now() + self.config.fetch_timeout();
            let until = match deadline {
                Some(d) if d < per_attempt => d,
                _ => per_attempt,
            };

            match tokio::time::timeout_at(until, self.source.fetch_page(state)).await {
                Ok(Ok(page)) => return Ok(page),
                Ok(Err(e)) if e.is_transient() => {
                    warn!(cursor = %state, attempt, error = %e, "page fetch failed, will retry");
                    last = e.to_string();
                }
                Ok(Err(e)) => {
                    return Err(Error::Source(format!("at cursor {}: {}", state, e)));
                }
                Err(_) if deadline.is_some_and(|d| Instant::now() >= d) => {
                    return Err(Error::DeadlineExceeded);
                }
                Err(_) => {
                    warn!(cursor = %state, attempt, "page fetch timed out, will retry");
                    last = format!("timed out after {:?}", self.config.fetch_timeout());
                }
            }
        }

        Err(Error::FetchExhausted {
            cursor: state.to_string(),
            attempts,
            last,
        })
    }

    async fn apply_page(
        &self,
        items: &[Value],
        summary: &mut IngestSummary,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let index = &self.index;
        let mut upserts = stream::iter(items.iter().cloned())
            .map(|item| async move {
                match parse_record(&item) {
                    Ok(record) => index.upsert(&record, deadline).await,
                    Err(e) => Err(e),
                }
            })
            .buffer_unordered(self.config.workers.max(1));

        // Returning early drops the stream, which cancels the upserts still
        // in flight and releases their connections.
        while let Some(result) = upserts.next().await {
            match result {
                Ok(outcome) => summary.record(outcome),
                Err(e @ (Error::DeadlineExceeded | Error::Closed)) => return Err(e),
                Err(e) => {
                    warn!(error = %e, "record rejected");
                    summary.failed += 1;
                }
            }
        }
        Ok(())
    }
}

/// CLI entry point: ingest from the configured source and print a summary.
///
/// `source_url` and `kind` override `[source] url` and `[source] kind`.
pub async fn run_ingest(
    config: &Config,
    source_url: Option<String>,
    kind: Option<String>,
) -> anyhow::Result<()> {
    let kind = kind.unwrap_or_else(|| config.source.kind.clone());
    let url = source_url.or_else(|| config.source.url.clone());
    let page_size = config.source.page_size;
    let timeout = config.ingest.fetch_timeout();

    let index = Arc::new(open_index(config).await?);

    let result = match kind.as_str() {
        "offset" => {
            let url = url.ok_or_else(|| anyhow::anyhow!("source.url required for offset source"))?;
            ingest_from(OffsetSource::new(url, page_size, timeout)?, &index, config).await
        }
        "cursor" => {
            let url = url.ok_or_else(|| anyhow::anyhow!("source.url required for cursor source"))?;
            ingest_from(CursorSource::new(url, page_size, timeout)?, &index, config).await
        }
        "jsonl" => {
            let path = config
                .source
                .path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("source.path required for jsonl source"))?;
            ingest_from(JsonlSource::open(path, page_size).await?, &index, config).await
        }
        other => anyhow::bail!(
            "Unknown source kind: '{}'. Must be offset, cursor, or jsonl.",
            other
        ),
    };

    index.pool().close().await;
    result
}

async fn ingest_from<S: PageSource>(
    source: S,
    index: &Arc<Index>,
    config: &Config,
) -> anyhow::Result<()> {
    let label = source.describe();
    let summary = Ingestor::new(source, index.clone(), &config.ingest)
        .run()
        .await?;

    println!("ingest {}", label);
    println!("  fetched:    {}", summary.fetched);
    println!("  inserted:   {}", summary.inserted);
    println!("  updated:    {}", summary.updated);
    println!("  duplicates: {}", summary.duplicates);
    println!("  failed:     {}", summary.failed);
    println!("ok");

    Ok(())
}
