use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDateTime};
use reqwest::Client;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::core::schemas::{Event, EventLocation, EventOrganizer, UNKNOWN_TITLE};

const GRIST_TIMEOUT: Duration = Duration::from_secs(15);
const NAIVE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Result of one write against the events table.
#[derive(Debug, Clone, Default)]
pub struct GristResult {
    pub success: bool,
    pub record_id: Option<i64>,
    pub record_url: Option<String>,
    pub error: Option<String>,
}

impl GristResult {
    fn failure(error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }
}

/// One row read back from the events table.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub record_id: i64,
    pub event: Event,
    pub editorial: Option<String>,
}

/// Connection settings for one Grist document.
#[derive(Debug, Clone)]
pub struct GristConfig {
    pub api_base: String,
    pub api_key: String,
    pub doc_id: String,
    pub table: String,
    /// UI links use a different short doc id and a page name.
    pub ui_base: String,
    pub ui_doc_id: String,
    pub ui_page: String,
}

/// Client for the Grist tabular store holding extracted events.
///
/// Datetime columns are written as naive wall-clock strings so the store
/// never converts them to UTC. Grist persists them as Unix timestamps by
/// parsing the naive value as if it were UTC; reads reverse that exact
/// transformation, so the round trip is consistent.
pub struct GristClient {
    config: GristConfig,
    client: Client,
}

impl GristClient {
    pub fn new(config: GristConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn records_url(&self) -> String {
        format!(
            "{}/docs/{}/tables/{}/records",
            self.config.api_base, self.config.doc_id, self.config.table
        )
    }

    fn record_url(&self, record_id: i64) -> String {
        // Anchor format: a=area, s=section widget, r=row, c=column
        format!(
            "{}/{}/{}#a1.s4.r{}.c0",
            self.config.ui_base, self.config.ui_doc_id, self.config.ui_page, record_id
        )
    }

    /// Append one event as a new row. Never errors to the caller: failures
    /// come back inside the result so job status stays independent of the
    /// store being reachable.
    pub async fn save_event(&self, event: &Event) -> GristResult {
        let payload = json!({
            "records": [{"fields": event_to_fields(event)}]
        });

        info!("Saving event to Grist: {}", event.title);

        let send = self
            .client
            .post(self.records_url())
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .timeout(GRIST_TIMEOUT)
            .send()
            .await;

        let res = match send {
            Ok(res) => res,
            Err(e) => {
                error!("Grist connection error: {}", e);
                return GristResult::failure(format!("Connection error: {}", e));
            }
        };

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            error!("Grist API error: status={}, body={}", status, body);
            return GristResult::failure(format!("Grist API returned {}: {}", status, body));
        }

        let data: Value = match res.json().await {
            Ok(data) => data,
            Err(e) => return GristResult::failure(format!("Bad Grist response: {}", e)),
        };

        match data["records"][0]["id"].as_i64() {
            Some(record_id) => {
                let record_url = self.record_url(record_id);
                info!(
                    "Event saved to Grist: record_id={}, url={}",
                    record_id, record_url
                );
                GristResult {
                    success: true,
                    record_id: Some(record_id),
                    record_url: Some(record_url),
                    error: None,
                }
            }
            None => GristResult::failure("No record ID returned from Grist".to_string()),
        }
    }

    /// Read events whose start time falls inside the half-open window
    /// [start, end), ordered by start time. An event starting exactly at
    /// `end` belongs to the next window.
    pub async fn fetch_events(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<StoredEvent>> {
        let url = format!(
            "{}/docs/{}/sql",
            self.config.api_base, self.config.doc_id
        );
        let sql = format!(
            "select id, {t}.* from {t} where StartDatetime >= ? and StartDatetime < ? order by StartDatetime",
            t = self.config.table
        );
        let payload = json!({
            "sql": sql,
            "args": [start.and_utc().timestamp(), end.and_utc().timestamp()],
        });

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .timeout(GRIST_TIMEOUT)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("Grist API returned {}: {}", status, body));
        }

        let data: Value = res.json().await?;
        let records = data["records"].as_array().cloned().unwrap_or_default();
        Ok(records.iter().filter_map(record_to_stored_event).collect())
    }

    /// Overwrite the stored fields of an existing row.
    pub async fn update_event(&self, record_id: i64, event: &Event) -> bool {
        info!("Updating Grist event id {}: {}", record_id, event.title);
        self.patch_fields(record_id, event_to_fields(event)).await
    }

    /// Set only the editorial column, leaving extraction fields untouched.
    pub async fn update_editorial(&self, record_id: i64, editorial: &str) -> bool {
        let mut fields = Map::new();
        fields.insert("Editorial".to_string(), json!(editorial));
        self.patch_fields(record_id, fields).await
    }

    async fn patch_fields(&self, record_id: i64, fields: Map<String, Value>) -> bool {
        let payload = json!({
            "records": [{"id": record_id, "fields": fields}]
        });

        let send = self
            .client
            .patch(self.records_url())
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .timeout(GRIST_TIMEOUT)
            .send()
            .await;

        match send {
            Ok(res) if res.status().is_success() => true,
            Ok(res) => {
                let status = res.status();
                let body = res.text().await.unwrap_or_default();
                error!(
                    "Grist API error updating record {}: status={}, body={}",
                    record_id, status, body
                );
                false
            }
            Err(e) => {
                error!("Grist connection error: {}", e);
                false
            }
        }
    }
}

/// Strip any timezone suffix so the store receives pure wall-clock time.
fn to_naive_string(datetime: &str) -> Option<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(datetime) {
        return Some(dt.naive_local().format(NAIVE_FORMAT).to_string());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(datetime, NAIVE_FORMAT) {
        return Some(dt.format(NAIVE_FORMAT).to_string());
    }
    warn!("Unparseable event datetime: {}", datetime);
    None
}

/// Reverse the write-side transformation: the stored timestamp is the naive
/// wall-clock value read as UTC.
fn timestamp_to_naive_string(value: &Value) -> Option<String> {
    let ts = value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))?;
    let dt = DateTime::from_timestamp(ts, 0)?;
    Some(dt.naive_utc().format(NAIVE_FORMAT).to_string())
}

/// Flatten the nested event into the table's column layout, dropping empty
/// values since Grist rejects explicit nulls.
fn event_to_fields(event: &Event) -> Map<String, Value> {
    let mut fields = Map::new();
    let mut put = |key: &str, value: Option<Value>| {
        if let Some(v) = value {
            if !v.is_null() {
                fields.insert(key.to_string(), v);
            }
        }
    };

    put("Title", Some(json!(event.title)));
    put(
        "StartDatetime",
        event
            .start_datetime
            .as_deref()
            .and_then(to_naive_string)
            .map(Value::from),
    );
    put(
        "EndDatetime",
        event
            .end_datetime
            .as_deref()
            .and_then(to_naive_string)
            .map(Value::from),
    );
    put("Description", event.description.clone().map(Value::from));
    put("SourceURL", event.source_url.clone().map(Value::from));
    put("Price", event.price.clone().map(Value::from));
    if !event.tags.is_empty() {
        put("Tags", Some(json!(event.tags.join(", "))));
    }
    put("ImageURL", event.image_url.clone().map(Value::from));
    put("ConfidenceScore", event.confidence_score.map(Value::from));
    put(
        "CreatedAt",
        Some(json!(
            chrono::Local::now().naive_local().format(NAIVE_FORMAT).to_string()
        )),
    );

    if let Some(ref location) = event.location {
        put("Venue", location.venue.clone().map(Value::from));
        put("Address", location.address.clone().map(Value::from));
        put("City", location.city.clone().map(Value::from));
        put(
            "LocationType",
            serde_json::to_value(location.kind).ok(),
        );
    }

    if let Some(ref organizer) = event.organizer {
        put("OrganizerName", organizer.name.clone().map(Value::from));
    }

    fields
}

fn record_to_stored_event(record: &Value) -> Option<StoredEvent> {
    let fields = record.get("fields").unwrap_or(record);
    let record_id = record
        .get("id")
        .or_else(|| fields.get("id"))
        .and_then(Value::as_i64)?;

    let get_str =
        |key: &str| fields.get(key).and_then(Value::as_str).map(str::to_string);

    let location = EventLocation {
        venue: get_str("Venue"),
        address: get_str("Address"),
        city: get_str("City"),
        ..Default::default()
    };

    let organizer = get_str("OrganizerName").map(|name| EventOrganizer {
        name: Some(name),
        ..Default::default()
    });

    let tags = get_str("Tags")
        .map(|t| {
            t.split(", ")
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let event = Event {
        title: get_str("Title").unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
        description: get_str("Description"),
        start_datetime: fields
            .get("StartDatetime")
            .and_then(timestamp_to_naive_string),
        end_datetime: fields
            .get("EndDatetime")
            .and_then(timestamp_to_naive_string),
        location: Some(location),
        organizer,
        price: get_str("Price"),
        tags,
        image_url: get_str("ImageURL"),
        source_url: get_str("SourceURL"),
        confidence_score: fields.get("ConfidenceScore").and_then(Value::as_f64),
        ..Default::default()
    };

    Some(StoredEvent {
        record_id,
        event,
        editorial: get_str("Editorial"),
    })
}
