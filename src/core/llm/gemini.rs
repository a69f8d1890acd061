use anyhow::{Result, anyhow};
use base64::Engine;
use chrono::{Datelike, Local};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

use super::{EventExtractor, clean_response_text, repair_json};
use crate::core::schemas::Event;

const LLM_TIMEOUT: Duration = Duration::from_secs(60);
const LAST_RESPONSE_MAX_CHARS: usize = 300;

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inline_data", skip_serializing_if = "Option::is_none")]
    inline_data: Option<GeminiInlineData>,
}

#[derive(Serialize)]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiResContent,
}

#[derive(Deserialize)]
struct GeminiResContent {
    parts: Vec<GeminiResPart>,
}

#[derive(Deserialize)]
struct GeminiResPart {
    text: String,
}

/// Retry policy for model calls. Thresholds are configuration, not
/// invariants.
#[derive(Debug, Clone)]
pub struct ExtractorPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub retry_delay: Duration,
}

impl Default for ExtractorPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Gemini-backed event extractor: prompt construction, JSON parsing with
/// repair, and rate-limit aware retry.
pub struct GeminiExtractor {
    api_key: String,
    model_id: String,
    base_url: String,
    client: Client,
    policy: ExtractorPolicy,
}

impl GeminiExtractor {
    pub fn new(api_key: String, model_id: String) -> Self {
        Self::with_policy(api_key, model_id, ExtractorPolicy::default())
    }

    pub fn with_policy(api_key: String, model_id: String, policy: ExtractorPolicy) -> Self {
        Self {
            api_key,
            model_id,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            client: Client::new(),
            policy,
        }
    }

    async fn generate_content(&self, parts: Vec<GeminiPart>) -> Result<String> {
        let req = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts,
            }],
        };
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model_id, self.api_key
        );
        let res = self
            .client
            .post(&url)
            .json(&req)
            .timeout(LLM_TIMEOUT)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "Gemini API error {}: {}",
                res.status().as_u16(),
                res.text().await.unwrap_or_default()
            ));
        }
        let parsed: GeminiResponse = res.json().await?;
        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| anyhow!("Gemini response contained no candidates"))
    }

    /// Run the retry loop over one prepared request. The returned Event is
    /// the sentinel failure value once the retry ceiling is hit.
    async fn run_with_retries(
        &self,
        parts: Vec<GeminiPart>,
        source_url: Option<&str>,
        source_description: Option<&str>,
    ) -> Event {
        let mut last_error = String::new();
        let mut last_response = String::new();

        for attempt in 0..self.policy.max_retries {
            let outcome = async {
                let raw = self.generate_content(clone_parts(&parts)).await?;
                let cleaned = clean_response_text(&raw);
                last_response = cleaned.clone();
                parse_event_payload(&cleaned)
            }
            .await;

            match outcome {
                Ok(mut event) => {
                    event.source_url = source_url.map(str::to_string);
                    if let Some(desc) = source_description {
                        event.prepend_note(&format!("Source: {}.", desc));
                    }
                    return event;
                }
                Err(e) => {
                    last_error = e.to_string();
                    let final_attempt = attempt + 1 >= self.policy.max_retries;
                    if final_attempt {
                        break;
                    }
                    if should_backoff(&last_error) {
                        let delay = self.policy.base_delay * 2u32.pow(attempt as u32);
                        warn!(
                            "Rate limit or quota signal from model, retrying in {:?} (attempt {}/{})",
                            delay,
                            attempt + 1,
                            self.policy.max_retries
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!("Extraction error, retrying: {:.100}", last_error);
                        tokio::time::sleep(self.policy.retry_delay).await;
                    }
                }
            }
        }

        let mut notes = format!(
            "Failed after {} attempts: {}",
            self.policy.max_retries, last_error
        );
        if !last_response.is_empty() {
            let truncated: String = last_response.chars().take(LAST_RESPONSE_MAX_CHARS).collect();
            notes.push_str(&format!("\nLast response: {}", truncated));
        }
        error!("Extraction failed: {}", notes);
        Event::failed(source_url.map(str::to_string), notes)
    }
}

#[async_trait::async_trait]
impl EventExtractor for GeminiExtractor {
    async fn extract_from_page(
        &self,
        url: &str,
        content: &str,
        screenshot_b64: Option<&str>,
    ) -> Event {
        let prompt = build_extraction_prompt(url, content);
        let mut parts = vec![GeminiPart {
            text: Some(prompt),
            inline_data: None,
        }];

        if let Some(screenshot) = screenshot_b64 {
            // A bad screenshot is not worth failing the whole extraction over
            if base64::engine::general_purpose::STANDARD
                .decode(screenshot)
                .is_ok()
            {
                parts.push(GeminiPart {
                    text: None,
                    inline_data: Some(GeminiInlineData {
                        mime_type: "image/png".to_string(),
                        data: screenshot.to_string(),
                    }),
                });
            } else {
                warn!("Could not decode screenshot, extracting from text only");
            }
        }

        self.run_with_retries(parts, Some(url), None).await
    }

    async fn extract_from_image(
        &self,
        image_b64: &str,
        source_description: Option<&str>,
    ) -> Event {
        if let Err(e) = base64::engine::general_purpose::STANDARD.decode(image_b64) {
            error!("Failed to decode image: {}", e);
            return Event::failed(None, format!("Failed to decode image: {}", e));
        }

        let parts = vec![
            GeminiPart {
                text: Some(build_image_extraction_prompt()),
                inline_data: None,
            },
            GeminiPart {
                text: None,
                inline_data: Some(GeminiInlineData {
                    mime_type: "image/png".to_string(),
                    data: image_b64.to_string(),
                }),
            },
        ];

        self.run_with_retries(parts, None, source_description).await
    }
}

fn clone_parts(parts: &[GeminiPart]) -> Vec<GeminiPart> {
    parts
        .iter()
        .map(|p| GeminiPart {
            text: p.text.clone(),
            inline_data: p.inline_data.as_ref().map(|d| GeminiInlineData {
                mime_type: d.mime_type.clone(),
                data: d.data.clone(),
            }),
        })
        .collect()
}

/// Rate-limit and quota-exhaustion signals get exponential backoff; anything
/// else retries once more after a short fixed delay.
fn should_backoff(error_str: &str) -> bool {
    error_str.contains("429") || error_str.to_lowercase().contains("quota")
}

/// Parse a cleaned model response into an Event, applying the JSON repair
/// heuristics when strict parsing fails. Repaired payloads get a provenance
/// note prepended.
pub(crate) fn parse_event_payload(cleaned: &str) -> Result<Event> {
    let (value, repaired) = match serde_json::from_str::<serde_json::Value>(cleaned) {
        Ok(value) => (value, false),
        Err(parse_err) => {
            warn!("JSON parse failed, attempting repair: {}", parse_err);
            match repair_json(cleaned) {
                Some(value) => {
                    info!("JSON repair successful");
                    (value, true)
                }
                None => return Err(parse_err.into()),
            }
        }
    };

    let mut event: Event = serde_json::from_value(value)?;
    if repaired {
        event.prepend_note("JSON parsing required repair.");
    }
    Ok(event)
}

const EVENT_SCHEMA: &str = r#"{
  "title": "string (required - the event name/title)",
  "description": "string or null (event description/details)",
  "start_datetime": "ISO 8601 datetime string or null (e.g., '2025-11-20T18:30:00')",
  "end_datetime": "ISO 8601 datetime string or null",
  "timezone": "string or null (e.g., 'America/Los_Angeles', 'PST', 'UTC-8')",
  "location": {
    "type": "physical" | "virtual" | "hybrid",
    "venue": "string or null (venue name)",
    "address": "string or null (full address)",
    "city": "string or null",
    "url": "string or null (for virtual events)"
  } or null,
  "organizer": {
    "name": "string or null",
    "contact": "string or null (email or phone)",
    "url": "string or null"
  } or null,
  "registration_url": "string or null (link to register/buy tickets)",
  "price": "string or null (e.g., 'Free', '$20', '$10-$25')",
  "tags": ["array", "of", "strings"],
  "image_url": "string or null (main event image URL)",
  "confidence_score": number between 0 and 1 (your confidence in this extraction),
  "extraction_notes": "string or null (any issues, ambiguities, or important notes)"
}"#;

fn build_extraction_prompt(url: &str, content: &str) -> String {
    let now = Local::now();
    let current_date = now.format("%Y-%m-%d");
    let current_year = now.year();

    format!(
        r#"You are an expert at extracting structured event information from web pages.

Today's date is: {current_date}

I will provide you with content from a webpage at: {url}

Your task is to extract event information and return it as valid JSON matching this exact schema:

{EVENT_SCHEMA}

IMPORTANT INSTRUCTIONS:
1. Return ONLY valid JSON, no markdown code blocks or other text
2. Use null for any fields you cannot determine
3. For dates/times:
   - PREFER dates found in "STRUCTURED EVENT DATA" section if available - these are authoritative
   - Otherwise, use {current_year} as the year unless a different year is explicitly shown
   - If no year is specified and the month/day has passed, use {next_year}
   - NEVER guess past years - trust explicit dates in the content or default to {current_year}
4. If the page contains MULTIPLE events, extract the PRIMARY or FIRST event
5. For timezone: try to infer from location or context if not explicit
6. Set confidence_score based on how complete and certain the information is
7. Use extraction_notes to explain any assumptions, missing data, or ambiguities

WEBPAGE CONTENT:
{content}

Return your JSON response now:"#,
        next_year = current_year + 1,
    )
}

fn build_image_extraction_prompt() -> String {
    let now = Local::now();
    let current_date = now.format("%Y-%m-%d");
    let current_year = now.year();

    format!(
        r#"You are an expert at extracting event information from images such as event posters, flyers, screenshots, and promotional materials.

Today's date is: {current_date}

Analyze the attached image and extract event information. Return valid JSON matching this exact schema:

{EVENT_SCHEMA}

IMPORTANT INSTRUCTIONS:
1. Return ONLY valid JSON, no markdown code blocks or other text
2. Use null for any fields you cannot determine from the image
3. For dates/times:
   - If only a date is shown without time, set a reasonable time based on context (evening events ~19:00)
   - Use {current_year} as the year if no year is shown and the date hasn't passed
   - If the month/day has already passed this year and no year shown, use {next_year}
4. Read ALL text in the image carefully - event details are often in smaller text
5. Set confidence_score LOWER if:
   - Text is blurry, small, or hard to read
   - Information appears cut off or partially visible
   - Image quality is poor
   - You had to make assumptions about unclear text
6. Use extraction_notes to document:
   - Any text you couldn't read clearly
   - Assumptions you made
   - Parts of the image that seem cut off

Return your JSON response now:"#,
        next_year = current_year + 1,
    )
}
