//! Record retrieval by ID.
//!
//! Used by the `msgdex get` CLI command; the HTTP server calls
//! [`Index::get`](crate::index::Index::get) directly for `GET /records/{id}`.

use anyhow::Result;

use crate::config::Config;
use crate::error::Error;
use crate::index::open_index;
use crate::models::StoredRecord;

pub async fn get_record(config: &Config, id: &str) -> Result<StoredRecord> {
    let index = open_index(config).await?;
    let record = index.get(id, None).await;
    index.pool().close().await;

    match record? {
        Some(record) => Ok(record),
        None => Err(Error::NotFound(format!("record {}", id)).into()),
    }
}

/// CLI entry point: print one record and its search representation.
pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let record = get_record(config, id).await?;

    println!("--- Record ---");
    println!("id:          {}", record.id);
    println!("author:      {} ({})", record.author_name, record.author_id);
    println!("occurred_at: {}", record.occurred_at);
    println!();

    println!("--- Text ---");
    println!("{}", record.text);
    println!();

    println!("--- Tokens ({}) ---", record.search_representation.len());
    for (token, tf) in &record.search_representation {
        println!("  {:<24} {}", token, tf);
    }

    Ok(())
}
