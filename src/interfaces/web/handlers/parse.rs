use axum::{Json, extract::State, http::StatusCode};
use serde_json::{Value, json};
use tracing::info;

use super::super::AppState;
use crate::core::schemas::{MAX_WAIT_TIME_MS, ParseJob, ParseMode, ParseRequest, ParseResponse};

/// Async job submission. Validates the mode/payload pairing before any
/// request id exists, then queues the job and returns immediately.
pub async fn parse_event(
    State(state): State<AppState>,
    Json(request): Json<ParseRequest>,
) -> Result<Json<ParseResponse>, (StatusCode, Json<Value>)> {
    if let Err(detail) = validate(&request) {
        return Err((StatusCode::BAD_REQUEST, Json(json!({ "error": detail }))));
    }

    let response = ParseResponse::accepted();
    info!(
        "Accepted parse request {} (mode={:?})",
        response.request_id, request.parse_mode
    );

    state.runner.submit(ParseJob {
        request_id: response.request_id.clone(),
        callback_url: request.callback_url,
        origin_message_id: request.origin_message_id,
        parse_mode: request.parse_mode,
        url: request.url,
        image_base64: request.image_base64,
        include_screenshot: request.include_screenshot,
        wait_time: request.wait_time.min(MAX_WAIT_TIME_MS),
    });

    Ok(Json(response))
}

fn validate(request: &ParseRequest) -> Result<(), &'static str> {
    match request.parse_mode {
        ParseMode::Url if request.url.is_none() => {
            return Err("URL is required for 'url' parse mode");
        }
        ParseMode::Image if request.image_base64.is_none() => {
            return Err("image_base64 is required for 'image' parse mode");
        }
        ParseMode::Hybrid if request.url.is_none() || request.image_base64.is_none() => {
            return Err("Both URL and image_base64 are required for 'hybrid' parse mode");
        }
        _ => {}
    }

    if let Some(ref url) = request.url {
        match url::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            _ => return Err("url must be an absolute http(s) URL"),
        }
    }
    Ok(())
}
