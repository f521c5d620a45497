//! Router assembly: HTTP endpoints, lobby WebSocket upgrades, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;
pub mod ws;

/// Build the application router with:
/// - lobby WebSockets at `/ws/lobby/{project_id}/{teacher|student}`
/// - REST-ish API under `/api/v1/...`
/// - CORS (allow any origin/method/headers)
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // WebSocket lobby
        .route("/ws/lobby/:project_id/teacher", get(ws::ws_teacher_upgrade))
        .route("/ws/lobby/:project_id/student", get(ws::ws_student_upgrade))
        // HTTP API
        .route("/api/v1/health", get(http::http_health))
        .route(
            "/api/v1/projects/:project_id/attempts/begin",
            post(http::http_begin_attempt),
        )
        .route("/api/v1/attempts/:attempt_id", get(http::http_get_attempt))
        .route(
            "/api/v1/attempts/:attempt_id/answers",
            post(http::http_save_answer),
        )
        .route(
            "/api/v1/attempts/:attempt_id/finalize",
            post(http::http_finalize_attempt),
        )
        .route(
            "/api/v1/attempts/:attempt_id/results",
            get(http::http_get_results),
        )
        .route("/api/v1/jobs", post(http::http_enqueue_job))
        .route("/api/v1/jobs/:kind/:target_id", get(http::http_get_job))
        // State + CORS + HTTP tracing
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}
