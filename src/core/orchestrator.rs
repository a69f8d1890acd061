use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::info;

use crate::core::fetcher::BrowserFetcher;
use crate::core::llm::EventExtractor;
use crate::core::processor::ContentNormalizer;
use crate::core::schemas::{Event, ScrapeOutcome};

/// Confidence below this is still a success, but flagged. Configurable
/// policy, pending product input.
pub const DEFAULT_LOW_CONFIDENCE_THRESHOLD: f64 = 0.3;

/// Composes fetch, normalize, extract, authoritative-field override and
/// classification into one pipeline run. Collaborators are injected so test
/// variants are a construction choice.
pub struct ScrapePipeline {
    fetcher: Arc<dyn BrowserFetcher>,
    extractor: Arc<dyn EventExtractor>,
    normalizer: ContentNormalizer,
    low_confidence_threshold: f64,
}

impl ScrapePipeline {
    pub fn new(fetcher: Arc<dyn BrowserFetcher>, extractor: Arc<dyn EventExtractor>) -> Self {
        Self {
            fetcher,
            extractor,
            normalizer: ContentNormalizer::new(),
            low_confidence_threshold: DEFAULT_LOW_CONFIDENCE_THRESHOLD,
        }
    }

    pub fn with_low_confidence_threshold(mut self, threshold: f64) -> Self {
        self.low_confidence_threshold = threshold;
        self
    }

    /// Full URL pipeline. Never applies side effects: persistence happens in
    /// the task runner, strictly after a successful classification.
    pub async fn scrape_event(
        &self,
        url: &str,
        wait_time: u32,
        include_screenshot: bool,
    ) -> ScrapeOutcome {
        let mut metadata = Map::new();
        metadata.insert("url".to_string(), json!(url));
        metadata.insert("wait_time".to_string(), json!(wait_time));
        metadata.insert("screenshot_included".to_string(), json!(include_screenshot));

        // Stage 1: browser fetch
        let page = match self.fetcher.fetch(url, wait_time, include_screenshot).await {
            Ok(page) if page.success => page,
            Ok(page) => {
                metadata.insert("stage".to_string(), json!("browser_fetch"));
                return ScrapeOutcome::failure(
                    page.error.unwrap_or_else(|| "Page fetch failed".to_string()),
                    metadata,
                );
            }
            Err(e) => {
                metadata.insert("stage".to_string(), json!("browser_fetch"));
                return ScrapeOutcome::failure(e.to_string(), metadata);
            }
        };

        if let Some(ref title) = page.title {
            metadata.insert("page_title".to_string(), json!(title));
        }

        // Stage 2: content normalization, never fatal
        let normalized = self.normalizer.process(&page.html, &page.text);
        metadata.insert(
            "content_length".to_string(),
            json!(normalized.text.chars().count()),
        );

        // Stage 3: LLM extraction, failure comes back as a sentinel event
        let mut event = self
            .extractor
            .extract_from_page(url, &normalized.text, page.screenshot.as_deref())
            .await;

        // Stage 4: structured-data dates always win over model-inferred ones
        if let Some(ref fragment) = normalized.event_data {
            apply_json_ld_dates(&mut event, fragment);
        }

        if let Some(confidence) = event.confidence_score {
            metadata.insert("confidence_score".to_string(), json!(confidence));
        }

        if event.is_failed() {
            metadata.insert("stage".to_string(), json!("llm_extraction"));
            return ScrapeOutcome {
                success: false,
                event: Some(event),
                error: Some("LLM extraction failed".to_string()),
                metadata,
            };
        }

        info!("Pipeline extracted event: {}", event.title);
        self.classify(
            event,
            metadata,
            "Low confidence extraction - data may be incomplete",
        )
    }

    /// Image-only variant: no browser, no normalization, no override.
    pub async fn analyze_image(
        &self,
        image_b64: &str,
        source_description: Option<&str>,
    ) -> ScrapeOutcome {
        let mut metadata = Map::new();
        metadata.insert("parse_mode".to_string(), json!("image"));
        if let Some(desc) = source_description {
            metadata.insert("source_description".to_string(), json!(desc));
        }
        metadata.insert("image_size_b64".to_string(), json!(image_b64.len()));

        let event = self
            .extractor
            .extract_from_image(image_b64, source_description)
            .await;

        if let Some(confidence) = event.confidence_score {
            metadata.insert("confidence_score".to_string(), json!(confidence));
        }

        if event.is_failed() {
            metadata.insert("stage".to_string(), json!("image_extraction"));
            return ScrapeOutcome {
                success: false,
                event: Some(event),
                error: Some("Image extraction failed".to_string()),
                metadata,
            };
        }

        self.classify(
            event,
            metadata,
            "Low confidence extraction - image may be unclear",
        )
    }

    fn classify(
        &self,
        event: Event,
        mut metadata: Map<String, Value>,
        warning_text: &str,
    ) -> ScrapeOutcome {
        metadata.insert("stage".to_string(), json!("completed"));

        if let Some(confidence) = event.confidence_score {
            if confidence < self.low_confidence_threshold {
                metadata.insert("warning".to_string(), json!("low_confidence"));
                return ScrapeOutcome {
                    success: true,
                    event: Some(event),
                    error: Some(warning_text.to_string()),
                    metadata,
                };
            }
        }

        ScrapeOutcome {
            success: true,
            event: Some(event),
            error: None,
            metadata,
        }
    }
}

/// Overwrite model-inferred dates with the page's JSON-LD values. Structured
/// data is authoritative; models often get dates wrong.
fn apply_json_ld_dates(event: &mut Event, fragment: &Value) {
    let mut overrode = false;

    if let Some(start) = fragment.get("startDate").and_then(Value::as_str) {
        event.start_datetime = Some(strip_zero_millis(start));
        overrode = true;
    }
    if let Some(end) = fragment.get("endDate").and_then(Value::as_str) {
        event.end_datetime = Some(strip_zero_millis(end));
    }

    if overrode {
        event.prepend_note("Dates from JSON-LD structured data.");
    }
}

/// "2025-11-20T18:30:00.000-08:00" -> "2025-11-20T18:30:00-08:00"
fn strip_zero_millis(datetime: &str) -> String {
    datetime.replace(".000", "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fetcher::PageData;
    use anyhow::Result;
    use async_trait::async_trait;

    struct FixedFetcher {
        page: PageData,
    }

    #[async_trait]
    impl BrowserFetcher for FixedFetcher {
        async fn fetch(&self, _url: &str, _wait: u32, _shot: bool) -> Result<PageData> {
            Ok(self.page.clone())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl BrowserFetcher for FailingFetcher {
        async fn fetch(&self, _url: &str, _wait: u32, _shot: bool) -> Result<PageData> {
            Err(anyhow::anyhow!("net::ERR_NAME_NOT_RESOLVED"))
        }
    }

    struct FixedExtractor {
        event: Event,
    }

    impl FixedExtractor {
        fn new(event: Event) -> Self {
            Self { event }
        }
    }

    #[async_trait]
    impl EventExtractor for FixedExtractor {
        async fn extract_from_page(
            &self,
            url: &str,
            _content: &str,
            _screenshot: Option<&str>,
        ) -> Event {
            let mut event = self.event.clone();
            event.source_url = Some(url.to_string());
            event
        }

        async fn extract_from_image(&self, _image: &str, _desc: Option<&str>) -> Event {
            self.event.clone()
        }
    }

    fn pipeline_with(event: Event, page: PageData) -> ScrapePipeline {
        ScrapePipeline::new(
            Arc::new(FixedFetcher { page }),
            Arc::new(FixedExtractor::new(event)),
        )
    }

    fn ok_page(html: &str) -> PageData {
        PageData {
            success: true,
            html: html.to_string(),
            text: String::new(),
            screenshot: None,
            title: Some("Event Page".to_string()),
            error: None,
        }
    }

    fn confident_event(score: f64) -> Event {
        Event {
            title: "Poetry Night".to_string(),
            confidence_score: Some(score),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fetch_failure_terminates_at_browser_fetch_stage() {
        let pipeline = ScrapePipeline::new(
            Arc::new(FailingFetcher),
            Arc::new(FixedExtractor::new(confident_event(0.9))),
        );
        let outcome = pipeline.scrape_event("https://x.test", 3000, true).await;
        assert!(!outcome.success);
        assert_eq!(outcome.metadata["stage"], "browser_fetch");
        assert!(outcome.event.is_none());
    }

    #[tokio::test]
    async fn sentinel_event_is_classified_as_extraction_failure() {
        let failed = Event::failed(None, "Failed after 3 attempts: 429".to_string());
        let pipeline = pipeline_with(failed, ok_page("<html><body>x</body></html>"));
        let outcome = pipeline.scrape_event("https://x.test", 3000, false).await;
        assert!(!outcome.success);
        assert_eq!(outcome.metadata["stage"], "llm_extraction");
        assert!(outcome.event.is_some());
    }

    #[tokio::test]
    async fn confidence_just_below_threshold_is_flagged_success() {
        let pipeline = pipeline_with(confident_event(0.29), ok_page("<body>x</body>"));
        let outcome = pipeline.scrape_event("https://x.test", 3000, false).await;
        assert!(outcome.success);
        assert_eq!(outcome.metadata["warning"], "low_confidence");
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn confidence_at_threshold_is_plain_success() {
        let pipeline = pipeline_with(confident_event(0.3), ok_page("<body>x</body>"));
        let outcome = pipeline.scrape_event("https://x.test", 3000, false).await;
        assert!(outcome.success);
        assert!(!outcome.metadata.contains_key("warning"));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn json_ld_dates_override_model_dates() {
        let mut event = confident_event(0.9);
        event.start_datetime = Some("2025-01-01T00:00:00".to_string());
        let html = r#"<html><head><script type="application/ld+json">
            {"@type": "Event", "startDate": "2025-11-20T18:30:00.000-08:00"}
        </script></head><body>show</body></html>"#;
        let pipeline = pipeline_with(event, ok_page(html));

        let outcome = pipeline.scrape_event("https://x.test", 3000, false).await;
        assert!(outcome.success);
        let event = outcome.event.unwrap();
        assert_eq!(
            event.start_datetime.as_deref(),
            Some("2025-11-20T18:30:00-08:00")
        );
        assert!(
            event
                .extraction_notes
                .unwrap()
                .contains("Dates from JSON-LD structured data.")
        );
    }

    #[tokio::test]
    async fn image_variant_skips_fetch_and_override() {
        let pipeline = pipeline_with(confident_event(0.8), PageData::default());
        let outcome = pipeline.analyze_image("aGVsbG8=", Some("Discord upload")).await;
        assert!(outcome.success);
        assert_eq!(outcome.metadata["parse_mode"], "image");
        assert_eq!(outcome.metadata["source_description"], "Discord upload");
    }

    #[tokio::test]
    async fn image_sentinel_reports_image_extraction_stage() {
        let failed = Event::failed(None, "decode error".to_string());
        let pipeline = pipeline_with(failed, PageData::default());
        let outcome = pipeline.analyze_image("aGVsbG8=", None).await;
        assert!(!outcome.success);
        assert_eq!(outcome.metadata["stage"], "image_extraction");
    }
}
