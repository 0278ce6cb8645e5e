use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{SymbolConfig, SymbolRegistry, DEFAULT_WINDOW};

/// Shared application state
#[derive(Clone)]
pub struct ApiState {
    pub symbols: SymbolRegistry,
}

/// `/health` for liveness, `/symbols` for runtime symbol changes.
/// Anything else is 404.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/symbols", get(list_symbols))
        .route(
            "/symbols/:name",
            get(get_symbol).put(put_symbol).delete(delete_symbol),
        )
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` becomes true
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!("🩺 Health server listening on {}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("Health server error")?;

    info!("Health server stopped");
    Ok(())
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn list_symbols(State(state): State<ApiState>) -> Json<Vec<SymbolConfig>> {
    Json(state.symbols.snapshot())
}

async fn get_symbol(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<SymbolConfig>, ApiError> {
    state
        .symbols
        .get(&name)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Symbol {} is not tracked", name)))
}

/// Insert or replace; takes effect on the next cycle
async fn put_symbol(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Option<Json<SymbolUpdate>>,
) -> Result<Json<SymbolConfig>, ApiError> {
    let update = body.map(|Json(b)| b).unwrap_or_default();
    let config = SymbolConfig::new(&name)
        .with_expiry(update.expiry.unwrap_or_default())
        .with_window(update.window.unwrap_or(DEFAULT_WINDOW));

    state
        .symbols
        .upsert(config)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    info!("➕ Symbol {} tracked from next cycle", name);

    state
        .symbols
        .get(&name)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Symbol {} is not tracked", name)))
}

async fn delete_symbol(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.symbols.remove(&name) {
        Some(_) => {
            info!("➖ Symbol {} removed", name);
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(ApiError::NotFound(format!("Symbol {} is not tracked", name))),
    }
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Not found".to_string())
}

// ===== Types =====

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Default, Deserialize)]
struct SymbolUpdate {
    expiry: Option<String>,
    window: Option<usize>,
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
