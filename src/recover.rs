//! Recover structured JSON from free-form model output.
//!
//! Models wrap their answers in prose or markdown fencing no matter how the
//! prompt begs. Each extraction strategy is tried in order and the first
//! successful parse wins; if nothing parses the caller gets `None` and the
//! planning round handles it via the retry policy.

use serde_json::Value;

type Extractor = fn(&str) -> Option<Value>;

const EXTRACTORS: [Extractor; 4] = [parse_direct, parse_fenced, parse_braced, parse_bracketed];

pub fn extract_json(text: &str) -> Option<Value> {
    EXTRACTORS.iter().find_map(|extract| extract(text))
}

/// The whole text is already valid JSON.
fn parse_direct(text: &str) -> Option<Value> {
    serde_json::from_str(text.trim()).ok()
}

/// Bodies of ``` fenced blocks, with or without a `json` language tag.
fn parse_fenced(text: &str) -> Option<Value> {
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let Some(end) = after.find("```") else {
            break;
        };
        let mut body = after[..end].trim_start();
        if let Some(tagged) = body.strip_prefix("json") {
            body = tagged;
        }
        if let Ok(value) = serde_json::from_str(body.trim()) {
            return Some(value);
        }
        rest = &after[end + 3..];
    }
    None
}

/// Widest brace-delimited substring.
fn parse_braced(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if start >= end {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Widest bracket-delimited substring, accepted only as an array of objects.
fn parse_bracketed(text: &str) -> Option<Value> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if start >= end {
        return None;
    }
    let value: Value = serde_json::from_str(&text[start..=end]).ok()?;
    match value.as_array() {
        Some(items) if !items.is_empty() && items.iter().all(Value::is_object) => Some(value),
        _ => None,
    }
}
