//! Poll generation from room history. Platform poll widgets impose hard
//! limits, so the parser normalizes whatever the model returns: options are
//! deduplicated, truncated to the widget's 32-char cap, and clamped to
//! between 2 and 10 entries.

use crate::analysis::json::{extract_array, fix_json};
use crate::config::DialoguePollSettings;
use crate::model::Poll;
use serde_json::Value;

pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 10;
const OPTION_MAX_CHARS: usize = 32;
const DEFAULT_QUESTION: &str = "Which of today's discussions was the best?";

const DEFAULT_PROMPT: &str = "You are a chat-room host. From the room history below, write one \
light-hearted poll the members would enjoy voting on, with {max_options} short answer options \
(each under 30 characters). {guidance}\
Output ONLY a JSON object in this exact shape: \
{\"question\":\"...\",\"options\":[\"...\"]}\n\nHistory:\n{history}";

pub fn build_prompt(settings: &DialoguePollSettings, guidance: Option<&str>, history: &str) -> String {
    let guidance = match guidance {
        Some(g) if !g.trim().is_empty() => format!("Theme requested by the room: {}. ", g.trim()),
        _ => String::new(),
    };
    let template = settings.prompt.as_deref().unwrap_or(DEFAULT_PROMPT);
    template
        .replace("{max_options}", &settings.max_options.to_string())
        .replace("{guidance}", &guidance)
        .replace("{history}", history)
}

/// Parses and normalizes the model's poll. Returns `None` when fewer than
/// two usable options survive normalization.
pub fn parse(text: &str, max_options: usize) -> Option<Poll> {
    let value = extract_object(text)?;

    let question = value
        .get("question")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .unwrap_or(DEFAULT_QUESTION)
        .to_string();

    let cap = max_options.clamp(MIN_OPTIONS, MAX_OPTIONS);
    let mut options: Vec<String> = Vec::new();
    for raw in value.get("options")?.as_array()? {
        let Some(option) = raw.as_str() else { continue };
        let option = truncate_option(option.trim());
        if option.is_empty() || options.contains(&option) {
            continue;
        }
        options.push(option);
        if options.len() == cap {
            break;
        }
    }

    if options.len() < MIN_OPTIONS {
        return None;
    }
    Some(Poll { question, options })
}

fn extract_object(text: &str) -> Option<Value> {
    // The model may wrap the object in an array, or emit it bare.
    if let Some(array) = extract_array(text) {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&fix_json(array)) {
            if let Some(first) = items.into_iter().find(|v| v.is_object()) {
                return Some(first);
            }
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&fix_json(&text[start..=end])).ok()
}

fn truncate_option(option: &str) -> String {
    if option.chars().count() <= OPTION_MAX_CHARS {
        return option.to_string();
    }
    let head: String = option.chars().take(OPTION_MAX_CHARS - 3).collect();
    format!("{head}...")
}
