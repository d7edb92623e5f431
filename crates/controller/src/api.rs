//! REST routes.
//!
//! - `PUT  /api/device/cwmp/:sn/:method` - run a CWMP RPC on a device
//! - `PUT  /api/device/:sn/:mtp/:message` - send a USP message over an MTP
//! - `GET  /api/device/:sn/alive`        - keep-alive state of a device
//! - `GET  /api/bridge/pending`          - outstanding commands and counters
//! - `GET  /health`

use crate::error::ApiError;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use cwmp_bridge::{Bridge, CwmpMethod, DeviceId, Mtp, UspMessage};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
}

/// Build the REST router.
///
/// Requests are bounded by `request_timeout`; when it fires the handler
/// future is dropped, which cancels the device command it was waiting on.
pub fn router(bridge: Arc<Bridge>, request_timeout: Duration) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout));

    Router::new()
        .route("/health", get(health_check))
        .route("/api/bridge/pending", get(pending_stats))
        .route("/api/device/:sn/alive", get(device_alive))
        .route("/api/device/cwmp/:sn/:method", put(device_command))
        .route("/api/device/:sn/:mtp/:message", put(usp_command))
        .layer(middleware)
        .with_state(AppState { bridge })
}

/// Forward a CWMP RPC to a device and return its answer.
async fn device_command(
    State(state): State<AppState>,
    Path((sn, route)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let method =
        CwmpMethod::from_route(&route).ok_or_else(|| ApiError::UnknownMethod(route.clone()))?;

    let payload = parse_payload(&body)?;

    debug!(device_id = %sn, method = %method, "Device command requested");
    let answer = state
        .bridge
        .submit(sn, method.rpc_name(), payload, None)
        .await?;
    Ok(Json(answer))
}

/// Forward a USP message to an agent over the given MTP.
async fn usp_command(
    State(state): State<AppState>,
    Path((sn, mtp, route)): Path<(String, String, String)>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mtp = Mtp::from_route(&mtp).ok_or_else(|| ApiError::UnknownMtp(mtp.clone()))?;
    let message =
        UspMessage::from_route(&route).ok_or_else(|| ApiError::UnknownMessage(route.clone()))?;
    let payload = parse_payload(&body)?;

    debug!(device_id = %sn, mtp = %mtp, message = %message, "USP message requested");
    let answer = state
        .bridge
        .submit_usp(sn, mtp, message, payload, None)
        .await?;
    Ok(Json(answer))
}

/// Empty body is allowed for commands without arguments.
fn parse_payload(body: &Bytes) -> Result<serde_json::Value, ApiError> {
    if body.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidBody(e.to_string()))
}

async fn device_alive(
    State(state): State<AppState>,
    Path(sn): Path<String>,
) -> impl IntoResponse {
    let device = DeviceId::from(sn);
    let liveness = state.bridge.liveness(&device);
    let last_seen = state
        .bridge
        .keep_alive()
        .last_seen_ago(&device)
        .map(|ago| ago.as_secs());

    Json(serde_json::json!({
        "device": device,
        "alive": state.bridge.is_alive(&device),
        "liveness": liveness,
        "last_seen_secs_ago": last_seen,
    }))
}

async fn pending_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "count": state.bridge.pending_count(),
        "busy_devices": state.bridge.busy_devices(),
        "tracked_devices": state.bridge.tracked_devices(),
        "stats": state.bridge.stats(),
    }))
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": if state.bridge.is_running() { "healthy" } else { "stopped" },
        "service": "controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
