use regex::RegexBuilder;
use scraper::{Html, Selector};
use serde_json::Value;

/// Hard cap on the text block handed to the model, roughly 10k tokens.
const CONTENT_MAX_CHARS: usize = 40_000;
const DESCRIPTION_MAX_CHARS: usize = 500;
const RAW_JSON_LD_MAX_CHARS: usize = 2_000;

/// Output of one normalization pass: the LLM-ready text block plus the
/// authoritative JSON-LD event fragment, if the page embedded one.
pub struct NormalizedContent {
    pub text: String,
    pub event_data: Option<Value>,
}

/// Turns raw page markup into a bounded, LLM-ready text block.
///
/// JSON-LD structured data is rendered first so the model is biased toward
/// the authoritative values when page content disagrees with them.
pub struct ContentNormalizer {
    json_ld_re: regex::Regex,
    max_chars: usize,
}

impl ContentNormalizer {
    pub fn new() -> Self {
        Self::with_max_chars(CONTENT_MAX_CHARS)
    }

    pub fn with_max_chars(max_chars: usize) -> Self {
        let json_ld_re = RegexBuilder::new(
            r#"<script[^>]*type=["']application/ld\+json["'][^>]*>(.*?)</script>"#,
        )
        .dot_matches_new_line(true)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|_| regex::Regex::new(r"$^").unwrap());
        Self {
            json_ld_re,
            max_chars,
        }
    }

    /// Scan markup for embedded JSON-LD blocks. Returns all raw blocks and
    /// the first fragment that describes an event.
    pub fn extract_json_ld(&self, html: &str) -> (Vec<String>, Option<Value>) {
        let mut raw_blocks = Vec::new();
        let mut event_data: Option<Value> = None;

        for caps in self.json_ld_re.captures_iter(html) {
            let block = caps[1].trim().to_string();
            if let Ok(data) = serde_json::from_str::<Value>(&block) {
                if event_data.is_none() {
                    event_data = find_event_fragment(&data);
                }
            }
            raw_blocks.push(block);
        }

        (raw_blocks, event_data)
    }

    /// Extract human-readable main content from markup. Prefers article-like
    /// containers, falls back to the whole body.
    pub fn html_to_text(&self, html: &str) -> String {
        let document = Html::parse_document(html);

        for candidate in ["article", "main", "[role=\"main\"]", "body"] {
            let Ok(selector) = Selector::parse(candidate) else {
                continue;
            };
            let mut parts = Vec::new();
            for element in document.select(&selector) {
                let text = collect_text(element);
                if !text.is_empty() {
                    parts.push(text);
                }
            }
            if !parts.is_empty() {
                return parts.join("\n\n");
            }
        }

        String::new()
    }

    /// Main entry point: JSON-LD first, then readable page content, composed
    /// under labeled headings and truncated to the configured cap.
    pub fn process(&self, html: &str, fallback_text: &str) -> NormalizedContent {
        if html.is_empty() {
            return NormalizedContent {
                text: fallback_text.to_string(),
                event_data: None,
            };
        }

        let (raw_blocks, event_data) = self.extract_json_ld(html);

        let mut main_content = self.html_to_text(html);
        if main_content.is_empty() && !fallback_text.is_empty() {
            main_content = fallback_text.to_string();
        }

        let mut parts: Vec<String> = Vec::new();

        if let Some(ref data) = event_data {
            parts.push("## STRUCTURED EVENT DATA (use these dates!):".to_string());
            if let Some(name) = data.get("name").and_then(Value::as_str) {
                parts.push(format!("Event Name: {}", name));
            }
            if let Some(start) = data.get("startDate").and_then(Value::as_str) {
                parts.push(format!("Start Date: {}", start));
            }
            if let Some(end) = data.get("endDate").and_then(Value::as_str) {
                parts.push(format!("End Date: {}", end));
            }
            if let Some(loc) = data.get("location") {
                if let Some(venue) = loc.get("name").and_then(Value::as_str) {
                    parts.push(format!("Venue: {}", venue));
                }
                if let Some(addr) = loc.get("address") {
                    if let Some(addr_str) = addr.as_str() {
                        parts.push(format!("Address: {}", addr_str));
                    } else if addr.is_object() {
                        let pieces: Vec<&str> =
                            ["streetAddress", "addressLocality", "addressRegion"]
                                .iter()
                                .filter_map(|k| addr.get(*k).and_then(Value::as_str))
                                .filter(|s| !s.is_empty())
                                .collect();
                        if !pieces.is_empty() {
                            parts.push(format!("Address: {}", pieces.join(", ")));
                        }
                    }
                }
            }
            if let Some(desc) = data.get("description").and_then(Value::as_str) {
                parts.push(format!(
                    "Description: {}",
                    truncate_chars(desc, DESCRIPTION_MAX_CHARS)
                ));
            }
            parts.push(String::new());
        } else if !raw_blocks.is_empty() {
            // Could not recognize an event fragment, include raw JSON-LD anyway
            parts.push("## STRUCTURED DATA (JSON-LD):".to_string());
            parts.push(truncate_chars(&raw_blocks.join("\n"), RAW_JSON_LD_MAX_CHARS));
            parts.push(String::new());
        }

        parts.push("## PAGE CONTENT:".to_string());
        parts.push(main_content);

        let mut combined = parts.join("\n");
        if combined.chars().count() > self.max_chars {
            combined = format!(
                "{}\n\n[Content truncated...]",
                truncate_chars(&combined, self.max_chars)
            );
        }

        NormalizedContent {
            text: combined,
            event_data,
        }
    }
}

impl Default for ContentNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn is_event_object(data: &Value) -> bool {
    data.get("@type").and_then(Value::as_str) == Some("Event")
        || data.get("startDate").is_some()
}

/// Recognize an event fragment: a direct Event object, or one nested inside
/// a schema.org @graph list.
fn find_event_fragment(data: &Value) -> Option<Value> {
    if data.is_object() {
        if is_event_object(data) {
            return Some(data.clone());
        }
        if let Some(graph) = data.get("@graph").and_then(Value::as_array) {
            for item in graph {
                if item.is_object() && is_event_object(item) {
                    return Some(item.clone());
                }
            }
        }
    }
    None
}

fn collect_text(element: scraper::ElementRef<'_>) -> String {
    let skip = ["script", "style", "noscript", "nav"];
    let mut out = String::new();
    for node in element.descendants() {
        if let Some(text) = node.value().as_text() {
            let in_skipped = node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .map(|el| skip.contains(&el.name()))
                    .unwrap_or(false)
            });
            if !in_skipped {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(trimmed);
                }
            }
        }
    }
    out
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT_PAGE: &str = r#"
        <html><head>
        <script type="application/ld+json">
        {"@type": "Event", "name": "Poetry Night",
         "startDate": "2025-11-20T18:30:00.000-08:00",
         "location": {"name": "Books Inc.", "address": {"streetAddress": "1344 Park St", "addressLocality": "Alameda"}}}
        </script>
        </head><body><article><h1>Poetry Night</h1><p>An evening of readings.</p></article></body></html>
    "#;

    #[test]
    fn json_ld_event_fragment_is_recognized() {
        let normalizer = ContentNormalizer::new();
        let (_, event_data) = normalizer.extract_json_ld(EVENT_PAGE);
        let data = event_data.expect("event fragment");
        assert_eq!(data["name"], "Poetry Night");
    }

    #[test]
    fn first_event_fragment_wins() {
        let html = r#"
            <script type="application/ld+json">{"@type": "Event", "name": "First"}</script>
            <script type="application/ld+json">{"@type": "Event", "name": "Second"}</script>
        "#;
        let normalizer = ContentNormalizer::new();
        let (blocks, event_data) = normalizer.extract_json_ld(html);
        assert_eq!(blocks.len(), 2);
        assert_eq!(event_data.unwrap()["name"], "First");
    }

    #[test]
    fn graph_nested_event_is_found() {
        let html = r#"<script type="application/ld+json">
            {"@graph": [{"@type": "WebSite"}, {"@type": "Event", "startDate": "2026-01-05"}]}
        </script>"#;
        let normalizer = ContentNormalizer::new();
        let (_, event_data) = normalizer.extract_json_ld(html);
        assert_eq!(event_data.unwrap()["startDate"], "2026-01-05");
    }

    #[test]
    fn structured_section_precedes_page_content() {
        let normalizer = ContentNormalizer::new();
        let normalized = normalizer.process(EVENT_PAGE, "");
        let structured = normalized
            .text
            .find("STRUCTURED EVENT DATA")
            .expect("structured section");
        let content = normalized.text.find("PAGE CONTENT").expect("page content");
        assert!(structured < content);
        assert!(normalized.text.contains("Start Date: 2025-11-20T18:30:00.000-08:00"));
        assert!(normalized.text.contains("Address: 1344 Park St, Alameda"));
        assert!(normalized.event_data.is_some());
    }

    #[test]
    fn empty_html_falls_back_to_provided_text() {
        let normalizer = ContentNormalizer::new();
        let normalized = normalizer.process("", "plain text fallback");
        assert_eq!(normalized.text, "plain text fallback");
        assert!(normalized.event_data.is_none());
    }

    #[test]
    fn oversized_content_is_truncated_with_marker() {
        let body = format!(
            "<html><body><article>{}</article></body></html>",
            "event ".repeat(2_000)
        );
        let normalizer = ContentNormalizer::with_max_chars(500);
        let normalized = normalizer.process(&body, "");
        assert!(normalized.text.ends_with("[Content truncated...]"));
        assert!(normalized.text.chars().count() < 600);
    }

    #[test]
    fn script_and_style_text_is_dropped() {
        let html = r#"<html><body><script>var hidden = 1;</script><p>Visible words</p></body></html>"#;
        let normalizer = ContentNormalizer::new();
        let text = normalizer.html_to_text(html);
        assert!(text.contains("Visible words"));
        assert!(!text.contains("hidden"));
    }
}
