//! HTTP handlers for the relay surface.
//!
//! `POST /` relays a single JSON-RPC request. `GET /` is the liveness check,
//! `GET /status` the dashboard feed, `GET /metrics` the Prometheus text.
//!
//! Bodies are parsed by hand rather than through the `Json` extractor so a
//! malformed request still gets a JSON-RPC error envelope with HTTP 400.

use axum::{body::Bytes, extract::State, http::StatusCode, response::IntoResponse, Json};
use relay_core::{
    proxy::{RelayEngine, RelayError},
    types::{JsonRpcRequest, JsonRpcResponse},
};
use serde_json::Value;
use std::{sync::Arc, time::Instant};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RelayEngine>,
}

/// Relays one JSON-RPC request.
///
/// Batch arrays are rejected: the relay forwards single requests only.
pub async fn handle_rpc(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return malformed(Value::Null, format!("invalid JSON: {e}"));
        }
    };

    if payload.is_array() {
        return malformed(Value::Null, "batch requests not supported".to_string());
    }

    let id = payload.get("id").cloned().unwrap_or(Value::Null);
    let request: JsonRpcRequest = match serde_json::from_value(payload) {
        Ok(request) => request,
        Err(e) => {
            return malformed(id, format!("invalid JSON-RPC request: {e}"));
        }
    };

    let request_id = Arc::clone(&request.id);
    match state.engine.process_request(request).await {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(e) => {
            let status = match e {
                RelayError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
                RelayError::NoEndpointAvailable | RelayError::Upstream(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            (status, Json(JsonRpcResponse::error(e.code(), e.to_string(), request_id)))
        }
    }
}

fn malformed(id: Value, detail: String) -> (StatusCode, Json<JsonRpcResponse>) {
    tracing::debug!(detail = %detail, "rejected malformed request");
    (
        StatusCode::BAD_REQUEST,
        Json(JsonRpcResponse::error(
            RelayError::MalformedRequest(detail.clone()).code(),
            detail,
            Arc::new(id),
        )),
    )
}

/// Liveness check.
pub async fn handle_liveness() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Per-endpoint status feed for the dashboard.
pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.engine.registry().current();
    let status = state.engine.metrics().status(&snapshot, Instant::now());
    Json(status)
}

/// Prometheus exposition endpoint.
pub async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.engine.metrics().render_prometheus(),
    )
}
