//! Repair helpers for LLM JSON output. Models wrap arrays in code fences,
//! leave trailing commas, or emit curly quotes; the parsers in the analyzer
//! modules run their payloads through here before `serde_json`.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn code_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^```[a-zA-Z]*\s*|\s*```$").unwrap())
}

/// Extracts the first balanced `[...]` array from free-form model output.
pub fn extract_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Best-effort cleanup of common LLM JSON defects.
pub fn fix_json(text: &str) -> String {
    // Strip markdown code fences.
    let cleaned = code_fence().replace_all(text.trim(), "").to_string();

    // Curly quotes confuse serde.
    let cleaned = cleaned
        .replace('\u{201c}', "\"")
        .replace('\u{201d}', "\"")
        .replace('\u{2018}', "'")
        .replace('\u{2019}', "'");

    // Drop trailing commas before closing brackets.
    let mut out = String::with_capacity(cleaned.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = cleaned.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if matches!(next, Some(']') | Some('}')) {
                    // skip the trailing comma
                } else {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Parses the first JSON array of objects found in `text`, after repair.
pub fn parse_object_array(text: &str) -> Option<Vec<Value>> {
    let array = extract_array(text)?;
    let repaired = fix_json(array);
    let value: Value = serde_json::from_str(&repaired).ok()?;
    let items = value.as_array()?;
    Some(items.iter().filter(|v| v.is_object()).cloned().collect())
}

pub fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}
