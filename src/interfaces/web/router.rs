use axum::{
    Router,
    http::Method,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};

use super::AppState;
use super::handlers::{calendar, callback, health, parse, scrape};

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/parse", post(parse::parse_event))
        .route("/api/scrape", post(scrape::scrape_event))
        .route("/api/calendar", get(calendar::get_calendar))
        .route(
            "/api/calendar/update/{record_id}",
            post(calendar::update_calendar_event),
        )
        .route("/api/callback", post(callback::receive_callback))
        .route("/api/health", get(health::health_check))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::calendar::CalendarExporter;
    use crate::core::fetcher::{BrowserFetcher, PageData};
    use crate::core::grist::{GristClient, GristConfig};
    use crate::core::llm::EventExtractor;
    use crate::core::orchestrator::ScrapePipeline;
    use crate::core::schemas::Event;
    use crate::core::tasks::TaskRunner;
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Weekday;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    struct StubFetcher;

    #[async_trait]
    impl BrowserFetcher for StubFetcher {
        async fn fetch(&self, _url: &str, _wait: u32, _shot: bool) -> Result<PageData> {
            Ok(PageData {
                success: true,
                html: "<body><p>An evening of readings.</p></body>".to_string(),
                ..Default::default()
            })
        }
    }

    struct StubExtractor;

    #[async_trait]
    impl EventExtractor for StubExtractor {
        async fn extract_from_page(
            &self,
            url: &str,
            _content: &str,
            _screenshot: Option<&str>,
        ) -> Event {
            Event {
                title: "Poetry Night".to_string(),
                source_url: Some(url.to_string()),
                confidence_score: Some(0.9),
                ..Default::default()
            }
        }

        async fn extract_from_image(&self, _image: &str, _desc: Option<&str>) -> Event {
            Event {
                title: "Poetry Night".to_string(),
                confidence_score: Some(0.9),
                ..Default::default()
            }
        }
    }

    fn test_state() -> AppState {
        let pipeline = Arc::new(ScrapePipeline::new(
            Arc::new(StubFetcher),
            Arc::new(StubExtractor),
        ));
        let grist = Arc::new(GristClient::new(GristConfig {
            api_base: "http://127.0.0.1:9".to_string(),
            api_key: "test".to_string(),
            doc_id: "d1".to_string(),
            table: "Events".to_string(),
            ui_base: "http://127.0.0.1:9".to_string(),
            ui_doc_id: "d1short".to_string(),
            ui_page: "Events".to_string(),
        }));
        let runner = Arc::new(TaskRunner::new(pipeline.clone(), grist.clone()));
        let exporter = Arc::new(CalendarExporter::new(grist.clone(), Weekday::Mon));
        AppState {
            pipeline,
            runner,
            grist,
            exporter,
            notifier: None,
        }
    }

    async fn json_request(
        app: Router,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let body = match body {
            Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
            None => Body::empty(),
        };

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body_bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&body_bytes).unwrap_or(serde_json::json!({}));
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_service_and_active_tasks() {
        let app = build_router(test_state());
        let (status, json) = json_request(app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "weave");
        assert_eq!(json["active_tasks"], 0);
    }

    #[tokio::test]
    async fn parse_url_mode_without_url_is_rejected() {
        let app = build_router(test_state());
        let (status, json) = json_request(
            app,
            Method::POST,
            "/api/parse",
            Some(serde_json::json!({
                "callback_url": "http://127.0.0.1:9/callback"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("URL is required"));
    }

    #[tokio::test]
    async fn parse_hybrid_without_image_is_rejected_before_job_creation() {
        let state = test_state();
        let app = build_router(state.clone());
        let (status, json) = json_request(
            app,
            Method::POST,
            "/api/parse",
            Some(serde_json::json!({
                "callback_url": "http://127.0.0.1:9/callback",
                "parse_mode": "hybrid",
                "url": "https://x.test/event"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json.get("request_id").is_none());
        assert_eq!(state.runner.active_count(), 0);
    }

    #[tokio::test]
    async fn parse_rejects_non_http_scheme() {
        let app = build_router(test_state());
        let (status, json) = json_request(
            app,
            Method::POST,
            "/api/parse",
            Some(serde_json::json!({
                "callback_url": "http://127.0.0.1:9/callback",
                "url": "mailto:events@x.test"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("http(s)"));
    }

    #[tokio::test]
    async fn parse_accepts_valid_url_submission() {
        let app = build_router(test_state());
        let (status, json) = json_request(
            app,
            Method::POST,
            "/api/parse",
            Some(serde_json::json!({
                "callback_url": "http://127.0.0.1:9/callback",
                "url": "https://x.test/event"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "accepted");
        assert!(!json["request_id"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn scrape_runs_pipeline_synchronously() {
        let app = build_router(test_state());
        let (status, json) = json_request(
            app,
            Method::POST,
            "/api/scrape",
            Some(serde_json::json!({ "url": "https://x.test/event" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["event"]["title"], "Poetry Night");
    }

    #[tokio::test]
    async fn callback_with_missing_fields_is_rejected() {
        let app = build_router(test_state());
        let (status, json) = json_request(
            app,
            Method::POST,
            "/api/callback",
            Some(serde_json::json!({ "status": "completed" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Missing required fields");
    }

    #[tokio::test]
    async fn callback_without_consumer_still_acknowledges() {
        let app = build_router(test_state());
        let (status, json) = json_request(
            app,
            Method::POST,
            "/api/callback",
            Some(serde_json::json!({
                "request_id": "req-1",
                "status": "failed",
                "error": "boom"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
    }

    #[tokio::test]
    async fn calendar_rejects_malformed_start_date() {
        let app = build_router(test_state());
        let (status, json) = json_request(
            app,
            Method::GET,
            "/api/calendar?start_date=November",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("YYYY-MM-DD"));
    }
}
