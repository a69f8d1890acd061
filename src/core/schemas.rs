use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Title used when the model could not produce an extraction at all.
pub const FAILED_TITLE: &str = "Extraction Failed";

/// Fallback title when the model returns null for a required field.
pub const UNKNOWN_TITLE: &str = "Unknown Event";

fn default_title() -> String {
    UNKNOWN_TITLE.to_string()
}

fn deserialize_title<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(match raw {
        Some(t) if !t.trim().is_empty() => t,
        _ => default_title(),
    })
}

fn deserialize_confidence<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<f64> = Option::deserialize(deserializer)?;
    Ok(raw.map(|c| c.clamp(0.0, 1.0)))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LocationKind {
    #[default]
    Physical,
    Virtual,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EventLocation {
    #[serde(rename = "type", default)]
    pub kind: LocationKind,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EventOrganizer {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Structured event data extracted from a webpage or image.
///
/// Datetimes are ISO 8601 wall-clock strings with an implied local timezone.
/// They stay strings end-to-end so the tabular store never double-converts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "default_title", deserialize_with = "deserialize_title")]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start_datetime: Option<String>,
    #[serde(default)]
    pub end_datetime: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub location: Option<EventLocation>,
    #[serde(default)]
    pub organizer: Option<EventOrganizer>,
    #[serde(default)]
    pub registration_url: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_confidence")]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub extraction_notes: Option<String>,
}

impl Default for Event {
    fn default() -> Self {
        Self {
            title: default_title(),
            description: None,
            start_datetime: None,
            end_datetime: None,
            timezone: None,
            location: None,
            organizer: None,
            registration_url: None,
            price: None,
            tags: Vec::new(),
            image_url: None,
            source_url: None,
            confidence_score: None,
            extraction_notes: None,
        }
    }
}

impl Event {
    /// Sentinel event returned when every extraction attempt failed.
    pub fn failed(source_url: Option<String>, notes: String) -> Self {
        Self {
            title: FAILED_TITLE.to_string(),
            source_url,
            confidence_score: Some(0.0),
            extraction_notes: Some(notes),
            ..Default::default()
        }
    }

    pub fn is_failed(&self) -> bool {
        self.title == FAILED_TITLE
    }

    /// Prepend a provenance note, keeping any existing notes after it.
    pub fn prepend_note(&mut self, note: &str) {
        let existing = self.extraction_notes.take().unwrap_or_default();
        let combined = format!("{} {}", note, existing);
        self.extraction_notes = Some(combined.trim().to_string());
    }
}

/// Terminal result of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub success: bool,
    #[serde(default)]
    pub event: Option<Event>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ScrapeOutcome {
    pub fn failure(error: String, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            success: false,
            event: None,
            error: Some(error),
            metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    #[default]
    Url,
    Image,
    Hybrid,
}

/// Upper bound on the browser-fetch settle delay a caller may request.
pub const MAX_WAIT_TIME_MS: u32 = 30_000;

fn default_wait_time() -> u32 {
    3000
}

fn default_include_screenshot() -> bool {
    true
}

/// Synchronous extraction request: the caller waits for the full pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct ScrapeRequest {
    pub url: String,
    #[serde(default = "default_include_screenshot")]
    pub include_screenshot: bool,
    #[serde(default = "default_wait_time")]
    pub wait_time: u32,
}

/// Async job submission. Returns a request_id immediately; results arrive
/// via POST to `callback_url` when the background task finishes.
#[derive(Debug, Clone, Deserialize)]
pub struct ParseRequest {
    #[serde(default)]
    pub url: Option<String>,
    pub callback_url: String,
    #[serde(default)]
    pub origin_message_id: Option<u64>,
    #[serde(default)]
    pub parse_mode: ParseMode,
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default = "default_include_screenshot")]
    pub include_screenshot: bool,
    #[serde(default = "default_wait_time")]
    pub wait_time: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseResponse {
    pub request_id: String,
    pub status: String,
    pub message: String,
}

impl ParseResponse {
    pub fn accepted() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            status: "accepted".to_string(),
            message: "Request accepted, processing in background".to_string(),
        }
    }
}

/// One unit of background work. Owned by the task runner while executing,
/// dropped on completion. Nothing survives a process restart.
#[derive(Debug, Clone)]
pub struct ParseJob {
    pub request_id: String,
    pub callback_url: String,
    pub origin_message_id: Option<u64>,
    pub parse_mode: ParseMode,
    pub url: Option<String>,
    pub image_base64: Option<String>,
    pub include_screenshot: bool,
    pub wait_time: u32,
}

/// Payload POSTed to the callback address exactly once per job completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub request_id: String,
    #[serde(default)]
    pub origin_message_id: Option<u64>,
    pub status: String,
    #[serde(default)]
    pub event: Option<Event>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub record_id: Option<i64>,
}
