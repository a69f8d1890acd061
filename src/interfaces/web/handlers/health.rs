use axum::{Json, extract::State};
use serde_json::{Value, json};

use super::super::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "weave",
        "version": env!("CARGO_PKG_VERSION"),
        "active_tasks": state.runner.active_count(),
    }))
}
