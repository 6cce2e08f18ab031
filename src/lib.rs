//! # msgdex
//!
//! Ingests records from a paginated external feed, keeps them in SQLite
//! with an incrementally maintained inverted index, and answers ranked,
//! paginated full-text queries while ingestion is running.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ PageSource  │──▶│  Ingestor   │──▶│              │
//! │ offset/     │   │ retry+dedup │   │    Index     │
//! │ cursor/jsonl│   └─────────────┘   │ records +    │
//! └─────────────┘                     │ postings     │
//!                   ┌─────────────┐   │              │
//!   CLI / HTTP ────▶│QueryProcessor──▶│              │
//!                   └─────────────┘   └──────┬───────┘
//!                                            │
//!                                     ResourcePool (SQLite)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! msgdex init
//! msgdex ingest --source-url http://localhost:8000/messages/
//! msgdex search "car rental paris" --limit 5
//! msgdex serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Records, pages, responses |
//! | [`tokenize`] | Shared text analyzer |
//! | [`pool`] | Bounded connection pool |
//! | [`db`] | SQLite connections |
//! | [`migrate`] | Schema |
//! | [`index`] | Storage and inverted index |
//! | [`rank`] | Scoring and top-k |
//! | [`search`] | Query processor |
//! | [`source`] | Paginated sources |
//! | [`ingest`] | Ingestion coordinator |
//! | [`get`] | Record lookup |
//! | [`stats`] | Index statistics |
//! | [`server`] | HTTP server |

pub mod config;
pub mod db;
pub mod error;
pub mod get;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod pool;
pub mod rank;
pub mod search;
pub mod server;
pub mod source;
pub mod stats;
pub mod tokenize;

pub use error::{Error, Result};
