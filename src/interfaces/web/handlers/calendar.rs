use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::error;

use super::super::AppState;
use crate::core::schemas::Event;

#[derive(Deserialize)]
pub struct CalendarQuery {
    start_date: String,
}

/// Events starting inside the week beginning at `start_date`.
pub async fn get_calendar(
    State(state): State<AppState>,
    Query(query): Query<CalendarQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let start = NaiveDate::parse_from_str(&query.start_date, "%Y-%m-%d").map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "start_date must be YYYY-MM-DD" })),
        )
    })?;

    let window_start = start.and_hms_opt(0, 0, 0).unwrap_or_default();
    let window_end = window_start + chrono::Duration::days(7);

    match state.grist.fetch_events(window_start, window_end).await {
        Ok(stored) => {
            let events: Vec<Value> = stored
                .iter()
                .map(|s| {
                    json!({
                        "record_id": s.record_id,
                        "event": s.event,
                        "editorial": s.editorial,
                    })
                })
                .collect();
            Ok(Json(json!({ "events": events })))
        }
        Err(e) => {
            error!("Calendar fetch failed: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            ))
        }
    }
}

/// Overwrite a stored event's fields.
pub async fn update_calendar_event(
    State(state): State<AppState>,
    Path(record_id): Path<i64>,
    Json(event): Json<Event>,
) -> Json<Value> {
    let success = state.grist.update_event(record_id, &event).await;
    Json(json!({ "success": success }))
}
