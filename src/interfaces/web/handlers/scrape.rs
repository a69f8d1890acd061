use axum::{Json, extract::State};

use super::super::AppState;
use crate::core::schemas::{MAX_WAIT_TIME_MS, ScrapeOutcome, ScrapeRequest};

/// Synchronous pipeline run; the caller waits for the full outcome.
pub async fn scrape_event(
    State(state): State<AppState>,
    Json(request): Json<ScrapeRequest>,
) -> Json<ScrapeOutcome> {
    let outcome = state
        .pipeline
        .scrape_event(
            &request.url,
            request.wait_time.min(MAX_WAIT_TIME_MS),
            request.include_screenshot,
        )
        .await;
    Json(outcome)
}
