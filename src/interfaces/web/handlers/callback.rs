use axum::{Json, extract::State, http::StatusCode};
use serde_json::{Value, json};
use tracing::{error, info};

use super::super::AppState;
use crate::core::schemas::CallbackPayload;

/// Consumer-side delivery receiver. The agent POSTs here when a background
/// job finishes; the payload is routed to the Discord completion path.
pub async fn receive_callback(
    State(state): State<AppState>,
    Json(raw): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let has_required = raw.get("request_id").and_then(Value::as_str).is_some()
        && raw.get("status").and_then(Value::as_str).is_some();
    if !has_required {
        error!("Invalid callback payload: {}", raw);
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing required fields" })),
        ));
    }

    let payload: CallbackPayload = serde_json::from_value(raw).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("Malformed callback payload: {}", e) })),
        )
    })?;

    info!(
        "Received callback for request {} with status {}, record_id={:?}",
        payload.request_id, payload.status, payload.record_id
    );

    if let Some(ref notifier) = state.notifier {
        notifier.handle_parse_complete(payload).await;
    }

    Ok(Json(json!({ "success": true })))
}
