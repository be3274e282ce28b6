//! HTTP surface
//!
//! Stream routes hand off to [`StreamTranscoder`]; the remaining routes
//! expose the hardware catalog, session metrics and a health probe.

use axum::{
    extract::{Path, Query, RawQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::hardware::HardwareCatalog;
use crate::metrics::{self, MetricsSnapshot, SharedMetrics};
use crate::session::{StreamError, StreamTranscoder};

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// State shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub transcoder: StreamTranscoder,
    pub metrics: SharedMetrics,
}

/// JSON error body for failed stream requests
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl StreamError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            StreamError::InvalidUrl(_) | StreamError::Compatibility(_) => StatusCode::BAD_REQUEST,
            StreamError::Selection(_) => StatusCode::SERVICE_UNAVAILABLE,
            StreamError::Transcode(_) | StreamError::Buffer(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    url: String,
}

/// Handler for GET /stream/*url
///
/// The source URL is the rest of the path, raw or percent-encoded. When it
/// arrives raw, its own query string lands in the request query and is put
/// back.
async fn stream_by_path(
    State(state): State<AppState>,
    Path(url): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Response, StreamError> {
    let source = match query {
        Some(query) if url.contains("://") && !query.is_empty() => format!("{}?{}", url, query),
        _ => url,
    };
    state.transcoder.transcode_stream(&source).await
}

/// Handler for GET /stream?url=...
async fn stream_by_query(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, StreamError> {
    state.transcoder.transcode_stream(&query.url).await
}

/// Handler for GET /hardware
async fn get_hardware(State(state): State<AppState>) -> Json<HardwareCatalog> {
    Json(state.transcoder.catalog().clone())
}

/// Handler for GET /metrics
async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(metrics::snapshot(&state.metrics))
}

async fn health() -> &'static str {
    "OK"
}

/// Creates the axum Router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/stream", get(stream_by_query))
        .route("/stream/*url", get(stream_by_path))
        .route("/hardware", get(get_hardware))
        .route("/metrics", get(get_metrics))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve `router` on `addr` until `shutdown` is cancelled.
pub async fn run_server(
    router: Router,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "Listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}
