pub mod gemini;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::schemas::Event;

/// Pluggable extraction strategy. Implementations never error to the caller:
/// every failure path returns a sentinel Event carrying the error in its
/// extraction notes, so failure is an inspectable value rather than a panic
/// surface.
#[async_trait]
pub trait EventExtractor: Send + Sync {
    async fn extract_from_page(
        &self,
        url: &str,
        content: &str,
        screenshot_b64: Option<&str>,
    ) -> Event;

    async fn extract_from_image(&self, image_b64: &str, source_description: Option<&str>)
    -> Event;
}

/// Strip a markdown code-fence wrapper if the model added one despite
/// instructions.
pub fn clean_response_text(response_text: &str) -> String {
    let mut text = response_text.trim();

    if text.starts_with("```") {
        let inner: Vec<&str> = text.splitn(3, "```").collect();
        if inner.len() >= 2 {
            text = inner[1].trim();
            if let Some(stripped) = text.strip_prefix("json") {
                text = stripped.trim();
            }
        }
    }

    text.to_string()
}

/// Attempt to repair malformed JSON from a model response.
///
/// Two strategies, in order: truncate to the last closing brace, then close
/// every delimiter left open by a truncated response. Returns the parsed
/// value if either succeeds. Valid JSON passes through strategy one
/// untouched, so re-running repair on an already-repaired string is a no-op.
pub fn repair_json(response_text: &str) -> Option<Value> {
    if let Some(last_brace) = response_text.rfind('}') {
        let repaired = &response_text[..=last_brace];
        if let Ok(value) = serde_json::from_str::<Value>(repaired) {
            return Some(value);
        }
    }

    if let Some(repaired) = balance_delimiters(response_text) {
        if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
            return Some(value);
        }
    }

    None
}

/// Close unmatched strings, brackets and braces in nesting order. Returns
/// None when the input has nothing open (nothing to repair) or closes more
/// than it opens (not a truncation).
fn balance_delimiters(text: &str) -> Option<String> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => stack.push(c),
            '}' => {
                if stack.pop() != Some('{') {
                    return None;
                }
            }
            ']' => {
                if stack.pop() != Some('[') {
                    return None;
                }
            }
            _ => {}
        }
    }

    if stack.is_empty() && !in_string {
        return None;
    }

    let mut repaired = text.to_string();
    if in_string {
        repaired.push('"');
    }
    while let Some(open) = stack.pop() {
        repaired.push(if open == '{' { '}' } else { ']' });
    }
    Some(repaired)
}
