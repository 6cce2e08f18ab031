//! Query processor.
//!
//! Validates paging parameters, normalizes the raw query with the same
//! analyzer the index was built with, and asks the [`Index`] for one
//! ranked page under the configured query deadline.
//!
//! Out-of-range `page`/`limit` values are rejected here with
//! [`Error::InvalidQuery`]; the index underneath only clamps.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::{Config, QueryConfig};
use crate::error::{Error, Result};
use crate::index::{open_index, Index};
use crate::models::SearchResponse;

pub struct QueryProcessor {
    index: Arc<Index>,
    default_limit: u32,
    max_limit: u32,
    timeout: Duration,
}

impl QueryProcessor {
    pub fn new(index: Arc<Index>, config: &QueryConfig) -> Self {
        Self {
            index,
            default_limit: config.default_limit,
            max_limit: config.max_limit,
            timeout: config.timeout(),
        }
    }

    pub fn default_limit(&self) -> u32 {
        self.default_limit
    }

    pub fn max_limit(&self) -> u32 {
        self.max_limit
    }

    /// Search with the configured query timeout.
    pub async fn search(&self, raw: &str, page: u32, limit: u32) -> Result<SearchResponse> {
        self.search_until(raw, page, limit, Instant::now() + self.timeout)
            .await
    }

    pub async fn search_until(
        &self,
        raw: &str,
        page: u32,
        limit: u32,
        deadline: Instant,
    ) -> Result<SearchResponse> {
        if raw.trim().is_empty() {
            return Err(Error::InvalidQuery("query must not be empty".to_string()));
        }
        if page < 1 {
            return Err(Error::InvalidQuery("page must be >= 1".to_string()));
        }
        if limit < 1 || limit > self.max_limit {
            return Err(Error::InvalidQuery(format!(
                "limit must be between 1 and {}",
                self.max_limit
            )));
        }

        let terms = self.index.analyzer().query_terms(raw);
        debug!(terms = terms.len(), page, limit, "search");

        // A query of only stop words or short tokens matches nothing.
        if terms.is_empty() {
            return Ok(SearchResponse {
                results: Vec::new(),
                page,
                limit,
                total: 0,
            });
        }

        let ranked = self.index.search(&terms, page, limit, Some(deadline)).await?;
        Ok(SearchResponse {
            results: ranked.hits,
            page,
            limit,
            total: ranked.total,
        })
    }
}

/// CLI entry point: run one query and print the page to stdout.
pub async fn run_search(
    config: &Config,
    query: &str,
    page: u32,
    limit: Option<u32>,
) -> anyhow::Result<()> {
    let index = Arc::new(open_index(config).await?);
    let processor = QueryProcessor::new(index.clone(), &config.query);
    let limit = limit.unwrap_or(processor.default_limit());

    let response = processor.search(query, page, limit).await?;
    index.pool().close().await;

    if response.results.is_empty() {
        if response.total > 0 {
            println!("No results on page {} ({} total).", page, response.total);
        } else {
            println!("No results.");
        }
        return Ok(());
    }

    let first = (page as u64 - 1) * limit as u64;
    for (i, hit) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.4}] {} ({})",
            first + i as u64 + 1,
            hit.score,
            hit.author_name,
            hit.occurred_at
        );
        println!("    {}", hit.text.replace('\n', " ").trim());
        println!("    id: {}", hit.id);
        println!();
    }
    println!(
        "page {}: {} of {} results",
        response.page,
        response.results.len(),
        response.total
    );

    Ok(())
}
