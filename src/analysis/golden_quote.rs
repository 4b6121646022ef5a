use crate::analysis::json::{parse_object_array, str_field};
use crate::config::GoldenQuoteSettings;
use crate::model::GoldenQuote;
use serde_json::Value;

const DEFAULT_PROMPT: &str = "You are a chat-history analyst. Pick out up to {max_quotes} \
memorable quotes from the room history below: lines that are funny, sharp, or otherwise worth \
framing. Quote the message verbatim and say who sent it and why it stands out. \
Output ONLY a JSON array in this exact shape: \
[{\"content\":\"...\",\"sender\":\"...\",\"reason\":\"...\"}]\n\nHistory:\n{history}";

pub fn build_prompt(settings: &GoldenQuoteSettings, history: &str) -> String {
    let template = settings.prompt.as_deref().unwrap_or(DEFAULT_PROMPT);
    template
        .replace("{max_quotes}", &settings.max_quotes.to_string())
        .replace("{history}", history)
}

pub fn parse(text: &str, max_quotes: usize) -> Vec<GoldenQuote> {
    let Some(items) = parse_object_array(text) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(quote_from_value)
        .take(max_quotes)
        .collect()
}

fn quote_from_value(value: &Value) -> Option<GoldenQuote> {
    let content = str_field(value, "content");
    if content.is_empty() {
        return None;
    }
    Some(GoldenQuote {
        content,
        sender: str_field(value, "sender"),
        reason: str_field(value, "reason"),
    })
}
