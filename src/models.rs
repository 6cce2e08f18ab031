//! Core data models used throughout msgdex.
//!
//! These types represent the records, source pages, and search results
//! that flow through the ingestion and query paths.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::tokenize::TermFrequencies;

/// A validated record as received from a source, before indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    pub occurred_at: DateTime<Utc>,
    pub text: String,
}

/// A record as persisted, with its derived token weights.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    pub occurred_at: String,
    pub text: String,
    pub search_representation: TermFrequencies,
}

/// Result of [`Index::upsert`](crate::index::Index::upsert).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// One page of raw items from a source plus where to continue.
///
/// Items stay as raw JSON so that one malformed item is rejected on its
/// own instead of failing the whole page.
#[derive(Debug, Clone)]
pub struct Page<S> {
    pub items: Vec<Value>,
    /// `None` signals end of stream.
    pub next: Option<S>,
}

/// A single ranked search hit, matching the HTTP response shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    pub occurred_at: String,
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

/// Counters reported at the end of an ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub fetched: u64,
    pub inserted: u64,
    pub updated: u64,
    pub duplicates: u64,
    pub failed: u64,
}

impl IngestSummary {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.duplicates += 1,
        }
    }
}

/// Validate one raw source item into a [`Record`].
///
/// Accepts both the camelCase field names (`authorId`, `authorName`,
/// `occurredAt`, `text`) and the legacy feed names (`user_id`,
/// `user_name`, `timestamp`, `message`).
pub fn parse_record(item: &Value) -> Result<Record> {
    let obj = item
        .as_object()
        .ok_or_else(|| Error::Validation("record is not a JSON object".to_string()))?;

    let field = |names: &[&str]| -> Result<String> {
        let (name, value) = names
            .iter()
            .find_map(|n| obj.get(*n).map(|v| (*n, v)))
            .ok_or_else(|| Error::Validation(format!("missing field '{}'", names[0])))?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Validation(format!("field '{}' must be a string", name)))
    };

    let id = field(&["id"])?;
    if id.trim().is_empty() {
        return Err(Error::Validation("field 'id' must not be empty".to_string()));
    }
    let author_id = field(&["authorId", "author_id", "user_id"])?;
    let author_name = field(&["authorName", "author_name", "user_name"])?;
    let occurred_raw = field(&["occurredAt", "occurred_at", "timestamp"])?;
    let occurred_at = parse_timestamp(&occurred_raw).ok_or_else(|| {
        Error::Validation(format!(
            "record {}: unparseable timestamp '{}'",
            id, occurred_raw
        ))
    })?;
    let text = field(&["text", "message"])?;

    Ok(Record {
        id,
        author_id,
        author_name,
        occurred_at,
        text,
    })
}

/// RFC 3339, or a zone-less `YYYY-MM-DDTHH:MM:SS[.f]` taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub fn format_ts_iso(ts_millis: i64) -> String {
    DateTime::from_timestamp_millis(ts_millis)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(|| ts_millis.to_string())
}
