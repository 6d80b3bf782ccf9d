pub mod chat;
pub mod status;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

pub fn configure(state: Arc<AppState>, executor_path: &str) -> Router {
    Router::new()
        .merge(chat::routes(state.clone(), executor_path))
        .merge(status::routes(state))
}
