use anyhow::Result;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Weekday};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::core::grist::{GristClient, StoredEvent};

const DESCRIPTION_MAX_CHARS: usize = 200;

/// Renders one week of stored events as digest markdown:
///
/// ```text
/// ## Tuesday, Nov 18
///
/// **6:30pm, Books Inc. (Alameda)**. An evening of readings. [[link](url)]
/// ```
pub struct CalendarExporter {
    grist: Arc<GristClient>,
    week_start: Weekday,
}

impl CalendarExporter {
    pub fn new(grist: Arc<GristClient>, week_start: Weekday) -> Self {
        Self { grist, week_start }
    }

    /// Start of the digest week containing `today`: the most recent
    /// configured weekday, on or before it.
    pub fn window_start(&self, today: NaiveDate) -> NaiveDate {
        let offset = (7 + today.weekday().num_days_from_monday()
            - self.week_start.num_days_from_monday())
            % 7;
        today - chrono::Duration::days(offset as i64)
    }

    /// Fetch one week of events and render the digest. `start` overrides the
    /// window anchor; by default the current week is exported.
    pub async fn export(&self, start: Option<NaiveDate>) -> Result<String> {
        let anchor = start.unwrap_or_else(|| self.window_start(chrono::Local::now().date_naive()));
        let window_start = anchor.and_hms_opt(0, 0, 0).unwrap_or_default();
        let window_end = window_start + chrono::Duration::days(7);

        let events = self.grist.fetch_events(window_start, window_end).await?;
        info!(
            "Calendar export: {} events between {} and {}",
            events.len(),
            window_start.date(),
            window_end.date()
        );
        Ok(render_markdown(&events, window_start, window_end))
    }
}

/// Group events by day and render the digest body. Events without a parseable
/// start time are dropped.
pub fn render_markdown(
    events: &[StoredEvent],
    window_start: NaiveDateTime,
    window_end: NaiveDateTime,
) -> String {
    let mut by_day: BTreeMap<NaiveDate, Vec<(NaiveDateTime, &StoredEvent)>> = BTreeMap::new();
    for stored in events {
        let Some(start) = stored
            .event
            .start_datetime
            .as_deref()
            .and_then(parse_naive_datetime)
        else {
            continue;
        };
        by_day.entry(start.date()).or_default().push((start, stored));
    }

    if by_day.is_empty() {
        return format!(
            "No events found between {} and {}.",
            window_start.date(),
            window_end.date()
        );
    }

    let mut lines = Vec::new();
    for (day, mut day_events) in by_day {
        lines.push(format!("## {}", day.format("%A, %b %d")));
        lines.push(String::new());

        day_events.sort_by_key(|(start, _)| *start);
        for (start, stored) in day_events {
            lines.push(event_line(start, stored));
            lines.push(String::new());
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

fn event_line(start: NaiveDateTime, stored: &StoredEvent) -> String {
    let location = stored
        .event
        .location
        .as_ref()
        .map(|loc| match (&loc.venue, &loc.city) {
            (Some(venue), Some(city)) => format!("{} ({})", venue, city),
            (Some(venue), None) => venue.clone(),
            (None, Some(city)) => city.clone(),
            (None, None) => "Location TBD".to_string(),
        })
        .unwrap_or_else(|| "Location TBD".to_string());

    let mut line = format!("**{}, {}**.", format_time(start), location);

    if let Some(ref description) = stored.event.description {
        if !description.is_empty() {
            line.push(' ');
            line.push_str(&truncate_description(description));
        }
    }

    if let Some(ref editorial) = stored.editorial {
        if !editorial.is_empty() {
            line.push_str(&format!(" _{}_", editorial));
        }
    }

    if let Some(ref url) = stored.event.source_url {
        line.push_str(&format!(" [[link]({})]", url));
    }

    line
}

/// "6:30pm" style, no leading zero.
fn format_time(dt: NaiveDateTime) -> String {
    dt.format("%l:%M%P").to_string().trim_start().to_string()
}

fn truncate_description(description: &str) -> String {
    if description.chars().count() > DESCRIPTION_MAX_CHARS {
        let cut: String = description.chars().take(DESCRIPTION_MAX_CHARS - 3).collect();
        format!("{}...", cut)
    } else {
        description.to_string()
    }
}

fn parse_naive_datetime(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.naive_local())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schemas::{Event, EventLocation};

    fn stored(
        record_id: i64,
        title: &str,
        start: Option<&str>,
        venue: Option<&str>,
        city: Option<&str>,
    ) -> StoredEvent {
        StoredEvent {
            record_id,
            event: Event {
                title: title.to_string(),
                start_datetime: start.map(str::to_string),
                location: Some(EventLocation {
                    venue: venue.map(str::to_string),
                    city: city.map(str::to_string),
                    ..Default::default()
                }),
                ..Default::default()
            },
            editorial: None,
        }
    }

    fn window() -> (NaiveDateTime, NaiveDateTime) {
        let start = NaiveDate::from_ymd_opt(2025, 11, 17)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        (start, start + chrono::Duration::days(7))
    }

    #[test]
    fn events_group_under_day_headings() {
        let events = vec![
            stored(1, "Poetry Night", Some("2025-11-18T18:30:00"), Some("Books Inc."), Some("Alameda")),
            stored(2, "Late Show", Some("2025-11-18T21:00:00"), Some("The Lab"), None),
            stored(3, "Art Walk", Some("2025-11-20T12:00:00"), None, Some("Oakland")),
        ];
        let (start, end) = window();
        let md = render_markdown(&events, start, end);

        let tue = md.find("## Tuesday, Nov 18").expect("tuesday heading");
        let thu = md.find("## Thursday, Nov 20").expect("thursday heading");
        assert!(tue < thu);
        assert!(md.contains("**6:30pm, Books Inc. (Alameda)**."));
        assert!(md.contains("**9:00pm, The Lab**."));
        assert!(md.contains("**12:00pm, Oakland**."));
    }

    #[test]
    fn events_without_start_time_are_dropped() {
        let events = vec![
            stored(1, "Poetry Night", Some("2025-11-18T18:30:00"), Some("Books Inc."), None),
            stored(2, "Mystery Event", None, Some("Nowhere"), None),
        ];
        let (start, end) = window();
        let md = render_markdown(&events, start, end);
        assert!(md.contains("Books Inc."));
        assert!(!md.contains("Nowhere"));
    }

    #[test]
    fn empty_window_names_its_bounds() {
        let (start, end) = window();
        let md = render_markdown(&[], start, end);
        assert_eq!(md, "No events found between 2025-11-17 and 2025-11-24.");
    }

    #[test]
    fn long_descriptions_are_truncated() {
        let mut event = stored(1, "Poetry Night", Some("2025-11-18T18:30:00"), Some("Books Inc."), None);
        event.event.description = Some("x".repeat(300));
        event.event.source_url = Some("https://x.test/event".to_string());
        let (start, end) = window();
        let md = render_markdown(&[event], start, end);
        assert!(md.contains(&format!("{}...", "x".repeat(197))));
        assert!(md.contains("[[link](https://x.test/event)]"));
    }

    #[test]
    fn editorial_is_annotated_inline() {
        let mut event = stored(1, "Poetry Night", Some("2025-11-18T18:30:00"), Some("Books Inc."), None);
        event.editorial = Some("Our pick of the week.".to_string());
        let (start, end) = window();
        let md = render_markdown(&[event], start, end);
        assert!(md.contains("_Our pick of the week._"));
    }

    #[test]
    fn window_start_aligns_to_configured_weekday() {
        let exporter = CalendarExporter::new(
            Arc::new(GristClient::new(crate::core::grist::GristConfig {
                api_base: String::new(),
                api_key: String::new(),
                doc_id: String::new(),
                table: "Events".to_string(),
                ui_base: String::new(),
                ui_doc_id: String::new(),
                ui_page: String::new(),
            })),
            Weekday::Mon,
        );
        // 2025-11-20 is a Thursday
        let today = NaiveDate::from_ymd_opt(2025, 11, 20).unwrap();
        assert_eq!(
            exporter.window_start(today),
            NaiveDate::from_ymd_opt(2025, 11, 17).unwrap()
        );
        // A Monday maps to itself
        let monday = NaiveDate::from_ymd_opt(2025, 11, 17).unwrap();
        assert_eq!(exporter.window_start(monday), monday);
    }
}
