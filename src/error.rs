//! Error taxonomy shared by the pool, index, query and ingestion layers.
//!
//! Library operations return [`Error`]; the CLI wraps it in `anyhow` at
//! the edges. The variants map onto how a failure is scoped:
//!
//! | Variant | Scope | Retried |
//! |---------|-------|---------|
//! | [`Error::Validation`] | one record | no, counted as failed |
//! | [`Error::InvalidQuery`] | one request | no |
//! | [`Error::Transient`] | one page fetch | yes, with backoff |
//! | [`Error::ResourceExhausted`] | one call | no, surfaced immediately |
//! | [`Error::FetchExhausted`] | whole ingestion run | terminal |

use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// A source record is malformed (missing or mistyped field).
    #[error("invalid record: {0}")]
    Validation(String),

    /// Query parameters out of range, or a blank query string.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Network or timeout failure that may succeed on retry.
    #[error("transient I/O error: {0}")]
    Transient(String),

    /// The source answered but the answer is unusable (4xx, bad body).
    #[error("source error: {0}")]
    Source(String),

    /// No pooled connection became available in time.
    #[error("no storage connection available after {waited:?}")]
    ResourceExhausted { waited: Duration },

    /// The caller's deadline passed before the operation finished.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A page could not be fetched within the retry budget.
    #[error("fetch failed at cursor {cursor} after {attempts} attempts: {last}")]
    FetchExhausted {
        cursor: String,
        attempts: u32,
        last: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Persisted index state disagrees with itself.
    #[error("index consistency violation: {0}")]
    Consistency(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The pool was torn down while a caller still held a handle to it.
    #[error("connection pool is closed")]
    Closed,
}

impl Error {
    /// Whether retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Storage(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            Error::Transient(e.to_string())
        } else if e.is_decode() {
            Error::Source(format!("malformed page body: {}", e))
        } else {
            match e.status() {
                Some(status) if status.as_u16() == 429 || status.is_server_error() => {
                    Error::Transient(e.to_string())
                }
                _ => Error::Source(e.to_string()),
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Consistency(format!("stored token weights unreadable: {}", e))
    }
}
