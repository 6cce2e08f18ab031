//! Index statistics overview.
//!
//! A quick summary of what's indexed: record count, vocabulary size,
//! posting count, the most common tokens and connection pool occupancy.
//! Used by `msgdex stats` to confirm ingestion did what was expected.

use anyhow::Result;

use crate::config::Config;
use crate::index::open_index;

const TOP_TOKENS: u32 = 10;

/// Run the stats command: query the index and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let index = open_index(config).await?;
    let stats = index.stats(TOP_TOKENS).await?;
    let pool = index.pool().status();
    index.pool().close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("msgdex index stats");
    println!("==================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!("  Analyzer:     {}", index.analyzer().signature());
    println!();
    println!("  Records:      {}", stats.records);
    println!("  Tokens:       {}", stats.distinct_tokens);
    println!("  Postings:     {}", stats.postings);
    println!(
        "  Pool:         {} max, {} opened, {} discarded",
        pool.max_size, pool.opened, pool.discarded
    );

    if !stats.top_tokens.is_empty() {
        println!();
        println!("  Top tokens by document frequency:");
        println!("  {:<24} {:>8}", "TOKEN", "RECORDS");
        println!("  {}", "-".repeat(33));
        for (token, df) in &stats.top_tokens {
            println!("  {:<24} {:>8}", token, df);
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
