//! HTTP request handlers.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use wasmpipe_common::{CaptureSink, PipelineError, ResponseBuffer, StageRequest};

use crate::state::AppState;

/// Upper bound on a buffered request body.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Serve one request through the middleware chain.
///
/// The body is buffered once up front so every stage can read it without
/// consuming it. The chain writes into a deferred response buffer;
/// nothing reaches the client until the single flush at the end, so a
/// failing stage can still be converted into a clean error response.
pub async fn handle_pipeline(State(state): State<AppState>, req: Request) -> Response {
    let request_id = Uuid::new_v4();
    let (parts, body) = req.into_parts();

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(%request_id, error = %e, "Failed to buffer request body");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let cancel = CancellationToken::new();
    let stage_req = StageRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
        cancel: cancel.clone(),
    };

    debug!(
        %request_id,
        method = %stage_req.method,
        path = %stage_req.path(),
        "Dispatching to pipeline"
    );

    let (sink, captured) = CaptureSink::new();
    let mut rw = ResponseBuffer::new(Box::new(sink));

    let result = tokio::select! {
        result = state.chain().serve(&stage_req, &mut rw) => result,
        () = tokio::time::sleep(state.request_timeout()) => {
            // Signal the running guest before giving up on the request.
            cancel.cancel();
            Err(PipelineError::Cancelled)
        }
    };

    if let Err(e) = &result {
        warn!(%request_id, error = %e, "Pipeline request failed");
        if !rw.has_explicit_status() {
            rw.write_header(error_status(e));
        }
    }
    rw.flush();

    let Some(response) = captured.take() else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    out
}

/// Map a pipeline failure to an HTTP status when no stage set one.
fn error_status(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::Cancelled => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "wasmpipe",
    }))
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ready": true,
        "stages": state.stages().len(),
    }))
}

/// Per-stage pool status.
#[derive(Debug, Serialize)]
pub struct StageStatus {
    name: String,
    idle: usize,
    active: usize,
}

/// List provisioned stages and their pool occupancy.
pub async fn list_stages(State(state): State<AppState>) -> impl IntoResponse {
    let stages: Vec<StageStatus> = state
        .stages()
        .iter()
        .map(|stage| StageStatus {
            name: stage.name().to_string(),
            idle: stage.pool().idle_count(),
            active: stage.pool().active_count(),
        })
        .collect();

    Json(stages)
}
