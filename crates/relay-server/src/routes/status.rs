use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn shutdown(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::info!("shutdown requested");
    state.shutdown.cancel();
    Json(json!({"msg": "Shutting down..."}))
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/shutdown", get(shutdown))
        .route("/metrics", get(metrics))
        .with_state(state)
}
