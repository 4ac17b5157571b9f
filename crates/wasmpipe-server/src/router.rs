//! HTTP router configuration.
//!
//! Operational endpoints get fixed routes; everything else falls through
//! to the middleware chain.

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handler::{handle_pipeline, health_check, list_stages, readiness_check};
use crate::state::AppState;

/// Build the application router.
///
/// Routes:
/// - `GET /health` - Health check
/// - `GET /ready` - Readiness check
/// - `GET /stages` - Stage and pool status
/// - anything else - The wasm middleware chain
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stages", get(list_stages))
        .fallback(handle_pipeline)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
