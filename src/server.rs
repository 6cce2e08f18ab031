//! HTTP search surface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/search?q=&page=&limit=` | Ranked, paginated search |
//! | `GET`  | `/records/{id}` | One stored record with its token weights |
//! | `GET`  | `/health` | Storage reachability (never reads the corpus) |
//!
//! # Error Contract
//!
//! All error responses share one shape:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "invalid query: limit must be between 1 and 100" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500),
//! `unavailable` (503, no storage connection in time), `timeout` (504).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::error::Error;
use crate::index::{open_index, Index};
use crate::models::{SearchResponse, StoredRecord};
use crate::search::QueryProcessor;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    search: Arc<QueryProcessor>,
    index: Arc<Index>,
    timeout: Duration,
}

impl AppState {
    pub fn new(index: Arc<Index>, config: &Config) -> Self {
        Self {
            search: Arc::new(QueryProcessor::new(index.clone(), &config.query)),
            index,
            timeout: config.query.timeout(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/search", get(handle_search))
        .route("/records/{id}", get(handle_get_record))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Start the server on `[server] bind` and run until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let index = Arc::new(open_index(config).await?);
    let app = router(AppState::new(index.clone(), config));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "listening");
    println!("msgdex listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    index.pool().close().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        let (status, code) = match &e {
            Error::InvalidQuery(_) | Error::Validation(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::ResourceExhausted { .. } | Error::Closed => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            }
            Error::DeadlineExceeded => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            _ => {
                error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        AppError {
            status,
            code,
            message: e.to_string(),
        }
    }
}

// ============ GET /search ============

/// Raw query-string parameters. Numbers are parsed by hand so a bad
/// value gets the JSON error envelope instead of axum's plain-text one.
#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
    page: Option<String>,
    limit: Option<String>,
}

fn parse_param(name: &str, raw: Option<&str>, default: u32) -> Result<u32, AppError> {
    match raw {
        None => Ok(default),
        Some(s) => s
            .trim()
            .parse::<u32>()
            .map_err(|_| bad_request(format!("{} must be a positive integer, got '{}'", name, s))),
    }
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, AppError> {
    let query = params
        .q
        .as_deref()
        .ok_or_else(|| bad_request("missing required parameter 'q'"))?;
    let page = parse_param("page", params.page.as_deref(), 1)?;
    let limit = parse_param(
        "limit",
        params.limit.as_deref(),
        state.search.default_limit(),
    )?;

    let response = state.search.search(query, page, limit).await?;
    Ok(Json(response))
}

// ============ GET /records/{id} ============

async fn handle_get_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StoredRecord>, AppError> {
    let deadline = Instant::now() + state.timeout;
    match state.index.get(&id, Some(deadline)).await? {
        Some(record) => Ok(Json(record)),
        None => Err(not_found(format!("no record with id: {}", id))),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    database: &'static str,
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn handle_health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let deadline = Instant::now() + state.timeout;
    match state.index.ping(Some(deadline)).await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                database: "connected",
                version: env!("CARGO_PKG_VERSION"),
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unhealthy",
                database: "unavailable",
                version: env!("CARGO_PKG_VERSION"),
                error: Some(e.to_string()),
            }),
        ),
    }
}
