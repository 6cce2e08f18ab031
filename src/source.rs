//! Paginated record sources.
//!
//! A source is anything that can hand out one page of raw items at a
//! time plus the state to fetch the next page from. The ingestion
//! coordinator drives every source through [`PageSource`] and never
//! knows how paging works underneath.
//!
//! # Built-in sources
//!
//! | Source | `[source] kind` | Paging |
//! |--------|-----------------|--------|
//! | [`OffsetSource`] | `offset` | `GET {url}?skip=N&limit=M`, body `{"total", "items"}` |
//! | [`CursorSource`] | `cursor` | `GET {url}?limit=M&cursor=T`, body `{"items", "next"}` |
//! | [`JsonlSource`] | `jsonl` | one JSON object per line of a local file |
//!
//! A page with no items always ends the stream, whatever the source says
//! about a next page.
//!
//! # Errors
//!
//! Network failures, timeouts, HTTP 429 and 5xx come back as
//! [`Error::Transient`] and are retried by the caller. Other HTTP errors
//! and malformed page bodies are [`Error::Source`] and end the run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::Page;

#[async_trait]
pub trait PageSource: Send + Sync {
    /// Where the next fetch starts. Displayed in logs and in
    /// [`Error::FetchExhausted`] so an operator can see how far a run got.
    type State: Clone + Send + Sync + fmt::Display;

    /// Short label for logs, e.g. `offset:http://host/messages/`.
    fn describe(&self) -> String;

    fn start(&self) -> Self::State;

    async fn fetch_page(&self, state: &Self::State) -> Result<Page<Self::State>>;
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("msgdex/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

// ============ Offset paging ============

#[derive(Debug, Deserialize)]
struct OffsetBody {
    #[serde(default)]
    total: Option<u64>,
    #[serde(alias = "records")]
    items: Vec<Value>,
}

/// HTTP source paged by `skip`/`limit` query parameters.
pub struct OffsetSource {
    client: reqwest::Client,
    url: String,
    page_size: usize,
}

impl OffsetSource {
    pub fn new(url: impl Into<String>, page_size: usize, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
            page_size: page_size.max(1),
        })
    }
}

#[async_trait]
impl PageSource for OffsetSource {
    type State = u64;

    fn describe(&self) -> String {
        format!("offset:{}", self.url)
    }

    fn start(&self) -> u64 {
        0
    }

    async fn fetch_page(&self, skip: &u64) -> Result<Page<u64>> {
        let body: OffsetBody = self
            .client
            .get(&self.url)
            .query(&[("skip", *skip), ("limit", self.page_size as u64)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let next_skip = skip + body.items.len() as u64;
        let exhausted = body.items.is_empty() || body.total.is_some_and(|t| next_skip >= t);

        Ok(Page {
            items: body.items,
            next: (!exhausted).then_some(next_skip),
        })
    }
}

// ============ Cursor paging ============

#[derive(Debug, Deserialize)]
struct CursorBody {
    #[serde(alias = "records")]
    items: Vec<Value>,
    #[serde(default, alias = "next_cursor", alias = "nextCursor")]
    next: Option<String>,
}

/// Position in a cursor-paged stream. `None` is the beginning.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CursorState(pub Option<String>);

impl fmt::Display for CursorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(token) => write!(f, "{}", token),
            None => write!(f, "<start>"),
        }
    }
}

/// HTTP source paged by an opaque `cursor` token.
pub struct CursorSource {
    client: reqwest::Client,
    url: String,
    page_size: usize,
}

impl CursorSource {
    pub fn new(url: impl Into<String>, page_size: usize, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
            page_size: page_size.max(1),
        })
    }
}

#[async_trait]
impl PageSource for CursorSource {
    type State = CursorState;

    fn describe(&self) -> String {
        format!("cursor:{}", self.url)
    }

    fn start(&self) -> CursorState {
        CursorState::default()
    }

    async fn fetch_page(&self, state: &CursorState) -> Result<Page<CursorState>> {
        let mut request = self
            .client
            .get(&self.url)
            .query(&[("limit", self.page_size.to_string())]);
        if let Some(token) = &state.0 {
            request = request.query(&[("cursor", token.as_str())]);
        }

        let body: CursorBody = request.send().await?.error_for_status()?.json().await?;

        let next = match body.next {
            Some(token) if !token.is_empty() && !body.items.is_empty() => {
                Some(CursorState(Some(token)))
            }
            _ => None,
        };
        Ok(Page {
            items: body.items,
            next,
        })
    }
}

// ============ JSON lines ============

/// Local file with one record per line, paged by line offset.
///
/// A line that is not valid JSON is passed through as a string item so
/// it fails validation on its own instead of failing the page.
pub struct JsonlSource {
    path: PathBuf,
    lines: Vec<Value>,
    page_size: usize,
}

impl JsonlSource {
    pub async fn open(path: &Path, page_size: usize) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Source(format!("cannot read {}: {}", path.display(), e)))?;

        let lines = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_str(l).unwrap_or_else(|_| Value::String(l.to_string())))
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            lines,
            page_size: page_size.max(1),
        })
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[async_trait]
impl PageSource for JsonlSource {
    type State = u64;

    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }

    fn start(&self) -> u64 {
        0
    }

    async fn fetch_page(&self, offset: &u64) -> Result<Page<u64>> {
        let start = (*offset as usize).min(self.lines.len());
        let end = (start + self.page_size).min(self.lines.len());
        let items = self.lines[start..end].to_vec();
        let next = (end < self.lines.len()).then_some(end as u64);
        Ok(Page { items, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_cursor_state_display() {
        assert_eq!(CursorState(None).to_string(), "<start>");
        assert_eq!(CursorState(Some("abc".into())).to_string(), "abc");
    }

    #[test]
    fn test_offset_body_accepts_records_alias() {
        let body: OffsetBody =
            serde_json::from_str(r#"{"records": [{"id": "a"}], "total": 1}"#).unwrap();
        assert_eq!(body.items.len(), 1);
        assert_eq!(body.total, Some(1));
    }

    #[test]
    fn test_cursor_body_aliases() {
        let body: CursorBody =
            serde_json::from_str(r#"{"items": [], "next_cursor": "t2"}"#).unwrap();
        assert_eq!(body.next.as_deref(), Some("t2"));
        let body: CursorBody = serde_json::from_str(r#"{"items": []}"#).unwrap();
        assert!(body.next.is_none());
    }

    #[tokio::test]
    async fn test_jsonl_pages_and_bad_lines() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"id": "1"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file, r#"{{"id": "3"}}"#).unwrap();

        let source = JsonlSource::open(file.path(), 2).await.unwrap();
        assert_eq!(source.len(), 3);

        let first = source.fetch_page(&source.start()).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[1], Value::String("not json".into()));
        assert_eq!(first.next, Some(2));

        let second = source.fetch_page(&2).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.next, None);
    }

    #[tokio::test]
    async fn test_jsonl_missing_file_is_source_error() {
        let err = JsonlSource::open(Path::new("/nonexistent/msgdex.jsonl"), 10)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Source(_)));
    }
}
