// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Reads are public; switching the active
// key requires a Bearer token (see `auth`).
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::{require_bearer, AuthFailure};
use crate::app_state::AppState;
use crate::error::CacheError;
use crate::types::{SeriesKey, Tick};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/series", get(series))
        .route("/api/v1/window/:symbol/:interval", get(window))
        .route("/api/v1/active", get(get_active).post(set_active))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error mapping
// =============================================================================

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        let status = match &err {
            CacheError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            CacheError::Superseded => StatusCode::CONFLICT,
            CacheError::RouterClosed | CacheError::FeedUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<AuthFailure> for ApiError {
    fn from(err: AuthFailure) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: err.message().to_string(),
        }
    }
}

fn parse_key(symbol: &str, interval: &str) -> Result<SeriesKey, ApiError> {
    Ok(format!("{symbol}:{interval}").parse::<SeriesKey>()?)
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_health())
}

// =============================================================================
// Series listing & window reads
// =============================================================================

async fn series(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_series_list())
}

#[derive(Deserialize)]
struct WindowQuery {
    n: Option<usize>,
}

#[derive(Serialize)]
struct WindowResponse {
    key: SeriesKey,
    ticks: Vec<Tick>,
}

async fn window(
    State(state): State<Arc<AppState>>,
    Path((symbol, interval)): Path<(String, String)>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<WindowResponse>, ApiError> {
    let key = parse_key(&symbol, &interval)?;
    let n = query.n.unwrap_or_else(|| state.window_capacity());
    let ticks = state.store.window(&key, n);
    Ok(Json(WindowResponse { key, ticks }))
}

// =============================================================================
// Active key
// =============================================================================

async fn get_active(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.router.current_view())
}

#[derive(Deserialize)]
struct SetActiveRequest {
    symbol: String,
    interval: String,
}

async fn set_active(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SetActiveRequest>,
) -> Result<Response, ApiError> {
    require_bearer(&headers)?;
    let key = parse_key(&req.symbol, &req.interval)?;

    match state.router.set_active_key(key.clone()).await {
        Ok(view) => {
            info!(key = %key, ticks = view.ticks.len(), "active key set via API");
            state.runtime_config.write().active_key = key;
            Ok(Json(view).into_response())
        }
        Err(e) => {
            warn!(key = %key, error = %e, "active key switch failed");
            if e != CacheError::Superseded {
                state.push_error(format!("switch to {key} failed: {e}"));
            }
            Err(e.into())
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
