// =============================================================================
// REST API Endpoints: Axum 0.7
// =============================================================================
//
// Thin boundary over the cache service. All endpoints live under `/api/v1/`;
// every handler parses the key, calls one service operation and serialises
// the result. Hub errors map onto status codes in `error_response`.
//
// CORS is configured permissively; the hub serves read-mostly market data.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::cache_service::CacheService;
use crate::error::HubError;
use crate::market_data::{Since, Timeframe};
use crate::types::TimeframeKey;

// =============================================================================
// Router construction
// =============================================================================

/// Build the REST router with CORS middleware and the shared service.
pub fn router(service: Arc<CacheService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/markets", get(markets))
        .route("/api/v1/ohlcv", get(ohlcv))
        .route("/api/v1/series", get(series))
        .route("/api/v1/collectors", get(collectors))
        .route("/api/v1/collectors/start", post(start_collector))
        .route("/api/v1/collectors/stop", post(stop_collector))
        .route("/api/v1/collectors/status", get(collector_status))
        .layer(cors)
        .with_state(service)
}

// =============================================================================
// Request parsing & errors
// =============================================================================

fn default_asset() -> String {
    "BTC_USDT".to_string()
}

fn default_timeframe() -> String {
    "1h".to_string()
}

fn default_since() -> i64 {
    -1
}

fn default_limit() -> usize {
    10
}

#[derive(Deserialize)]
struct KeyParams {
    market_id: String,
    #[serde(default = "default_asset")]
    asset: String,
    #[serde(default = "default_timeframe")]
    timeframe: String,
}

impl KeyParams {
    fn key(&self) -> Result<TimeframeKey, HubError> {
        let timeframe: Timeframe = self.timeframe.parse()?;
        TimeframeKey::new(&self.market_id, &self.asset, timeframe)
    }
}

fn error_response(err: HubError) -> Response {
    let status = match &err {
        HubError::Validation(_) | HubError::InvalidTimeframe(_) => StatusCode::BAD_REQUEST,
        HubError::UnknownMarket(_) => StatusCode::NOT_FOUND,
        HubError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }
    let body = serde_json::json!({ "error": err.to_string() });
    (status, Json(body)).into_response()
}

// =============================================================================
// Health & markets
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    collectors: usize,
    server_time: i64,
}

async fn health(State(service): State<Arc<CacheService>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        collectors: service.collectors().len(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn markets(State(service): State<Arc<CacheService>>) -> impl IntoResponse {
    Json(serde_json::json!({ "markets": service.markets() }))
}

// =============================================================================
// OHLCV reads
// =============================================================================

#[derive(Deserialize)]
struct OhlcvParams {
    #[serde(flatten)]
    key: KeyParams,
    #[serde(default = "default_since")]
    since: i64,
    #[serde(default = "default_limit")]
    limit: usize,
}

async fn ohlcv(
    State(service): State<Arc<CacheService>>,
    Query(params): Query<OhlcvParams>,
) -> Response {
    let result = params
        .key
        .key()
        .and_then(|key| service.get_range(&key, Since::from_raw(params.since), params.limit));
    match result {
        Ok(candles) => Json(candles).into_response(),
        Err(e) => error_response(e),
    }
}

async fn series(
    State(service): State<Arc<CacheService>>,
    Query(params): Query<KeyParams>,
) -> Response {
    match params.key().and_then(|key| service.series_info(&key)) {
        Ok(index) => Json(index).into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Collector lifecycle
// =============================================================================

#[derive(Deserialize)]
struct StartRequest {
    #[serde(flatten)]
    key: KeyParams,
    /// Epoch ms; absent or negative starts from the current bucket.
    #[serde(default)]
    since: Option<i64>,
}

async fn start_collector(
    State(service): State<Arc<CacheService>>,
    Json(req): Json<StartRequest>,
) -> Response {
    let since = req.since.filter(|ts| *ts >= 0);
    let result = req
        .key
        .key()
        .and_then(|key| service.start_collector(&key, since));
    match result {
        Ok(state) => {
            info!(key = %state.key, run_id = %state.run_id, "collector start requested via API");
            Json(state).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn stop_collector(
    State(service): State<Arc<CacheService>>,
    Json(req): Json<KeyParams>,
) -> Response {
    let key = match req.key() {
        Ok(key) => key,
        Err(e) => return error_response(e),
    };
    let state = service.stop_collector(&key).await;
    Json(serde_json::json!({ "stopped": state.is_some(), "state": state })).into_response()
}

async fn collector_status(
    State(service): State<Arc<CacheService>>,
    Query(params): Query<KeyParams>,
) -> Response {
    let key = match params.key() {
        Ok(key) => key,
        Err(e) => return error_response(e),
    };
    match service.collector_status(&key) {
        Some(state) => Json(state).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no collector for {key}") })),
        )
            .into_response(),
    }
}

async fn collectors(State(service): State<Arc<CacheService>>) -> impl IntoResponse {
    Json(service.collectors())
}

// =============================================================================
// Tests
// =============================================================================
