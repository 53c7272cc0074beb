//! API version 1 endpoints.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::icarus::session::SessionSnapshot;
use crate::thread::ThreadError;
use crate::tracing::prelude::*;

/// Set option request payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SetOptionRequest {
    /// Option name, e.g. `baud` or `timing`
    pub name: String,
    pub value: String,
}

/// Set option response payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SetOptionResponse {
    /// Whether a stored value actually changed
    pub changed: bool,
    /// Whether the link will be reopened before the next job
    pub reopen: bool,
    /// Whether timing calibration was reset
    pub retime: bool,
}

/// API error response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

fn not_found(name: &str) -> Response {
    error_response(StatusCode::NOT_FOUND, format!("Device '{name}' not found"))
}

/// Health check endpoint handler.
async fn health() -> &'static str {
    "OK"
}

/// List devices endpoint handler.
///
/// # Example
/// ```bash
/// curl http://localhost:7785/api/v1/devices
/// ```
async fn list_devices(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    let devices = state.devices.read().await;
    let mut snapshots: Vec<_> = devices.values().map(|d| d.status()).collect();
    snapshots.sort_by(|a, b| a.name.cmp(&b.name));
    Json(snapshots)
}

async fn get_device(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.device(&name).await {
        Some(device) => Json(device.status()).into_response(),
        None => not_found(&name),
    }
}

/*  Set device option endpoint handler.

    Applies one runtime option at the device's next cycle boundary. Invalid
    values are rejected with 400 and the reason; nothing is changed.

    curl -X POST http://localhost:7785/api/v1/devices/ttyUSB0/options \
       -H "Content-Type: application/json" \
       -d '{"name": "timing", "value": "short=80"}'
*/
async fn set_option(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SetOptionRequest>,
) -> Response {
    debug!(device = %name, option = %req.name, value = %req.value, "API request to set option");

    let Some(device) = state.device(&name).await else {
        return not_found(&name);
    };

    match device.set_option(&req.name, &req.value).await {
        Ok(applied) => Json(SetOptionResponse {
            changed: applied.changed,
            reopen: applied.reopen_now,
            retime: applied.retime,
        })
        .into_response(),
        Err(ThreadError::Config(e)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e @ ThreadError::Disconnected) => {
            warn!(device = %name, "Option request for a stopped device.");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

async fn identify(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(device) = state.device(&name).await else {
        return not_found(&name);
    };
    match device.identify().await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// Build the v1 API routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/devices", get(list_devices))
        .route("/devices/:name", get(get_device))
        .route("/devices/:name/options", post(set_option))
        .route("/devices/:name/identify", post(identify))
        .with_state(state)
}
