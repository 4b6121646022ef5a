//! Per-member profile report: the member's own activity counters plus a
//! short free-text LLM portrait built from a sample of what they wrote.
//! Unlike the room-wide kinds this one answers a single user directly, so
//! the output is the reply text itself.

use crate::config::PersonalReportSettings;
use crate::model::{Message, MessageKind, Statistics};
use chrono::{DateTime, Utc};
use std::fmt::Write;

/// At most this many message bodies go into the prompt, newest last.
const SAMPLE_LIMIT: usize = 50;

const DEFAULT_PROMPT: &str = "You are a chat-room analyst. From this member's own messages \
below, write a short personal profile: their speaking style in two or three sentences, the \
interests their topics suggest, a playful room title for them, and a one-line summary. \
Plain prose, no markdown.\n\nTheir messages:\n{messages}";

/// The member's own text bodies, capped by config and then sampled down to
/// the newest `SAMPLE_LIMIT` for the prompt.
pub fn sample_texts(messages: &[Message], max_messages: usize) -> Vec<String> {
    let mut texts: Vec<String> = messages
        .iter()
        .filter(|m| m.kind == MessageKind::Text)
        .map(|m| m.body.trim().to_string())
        .filter(|body| !body.is_empty())
        .collect();
    if texts.len() > max_messages {
        texts.drain(..texts.len() - max_messages);
    }
    if texts.len() > SAMPLE_LIMIT {
        texts.drain(..texts.len() - SAMPLE_LIMIT);
    }
    texts
}

pub fn build_prompt(settings: &PersonalReportSettings, texts: &[String]) -> String {
    let template = settings.prompt.as_deref().unwrap_or(DEFAULT_PROMPT);
    template.replace("{messages}", &texts.join("\n"))
}

/// The reply text. `portrait` is `None` when the member wrote too little
/// for an LLM pass or the call failed; the counters still go out.
pub fn render(
    display_name: &str,
    statistics: &Statistics,
    generated_at: DateTime<Utc>,
    portrait: Option<&str>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Personal report for {display_name} ({})",
        generated_at.format("%Y-%m-%d")
    );
    let _ = writeln!(out, "\nActivity");
    let _ = writeln!(out, "  messages: {}", statistics.message_count);
    let _ = writeln!(out, "  characters: {}", statistics.char_count);
    let _ = writeln!(out, "  emotes: {}", statistics.emoji_count);
    let _ = writeln!(out, "  most active: {}", statistics.most_active_period);
    match portrait {
        Some(text) if !text.trim().is_empty() => {
            let _ = writeln!(out, "\nPortrait");
            let _ = writeln!(out, "{}", text.trim());
        }
        _ => {
            let _ = writeln!(out, "\nNot enough chat for a portrait yet.");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn msg(body: &str, kind: MessageKind) -> Message {
        Message {
            id: body.to_string(),
            room_id: "!r:x".to_string(),
            sender_id: "@alice:x".to_string(),
            sender_name: "alice".to_string(),
            timestamp: Utc::now(),
            body: body.to_string(),
            kind,
        }
    }

    #[test]
    fn sampling_keeps_newest_text_only() {
        let mut messages: Vec<Message> = (0..80)
            .map(|i| msg(&format!("line {i}"), MessageKind::Text))
            .collect();
        messages.push(msg("", MessageKind::Text));
        messages.push(msg("ignored", MessageKind::Media));

        let texts = sample_texts(&messages, 200);
        assert_eq!(texts.len(), SAMPLE_LIMIT);
        assert_eq!(texts.first().unwrap(), "line 30");
        assert_eq!(texts.last().unwrap(), "line 79");

        let capped = sample_texts(&messages, 10);
        assert_eq!(capped.len(), 10);
        assert_eq!(capped.last().unwrap(), "line 79");
    }

    #[test]
    fn prompt_substitutes_messages() {
        let texts = vec!["hello".to_string(), "world".to_string()];
        let prompt = build_prompt(&PersonalReportSettings::default(), &texts);
        assert!(prompt.contains("personal profile"));
        assert!(prompt.contains("hello\nworld"));
    }

    #[test]
    fn render_with_and_without_portrait() {
        let stats = Statistics {
            message_count: 12,
            char_count: 340,
            emoji_count: 2,
            most_active_period: "evening".to_string(),
            ..Statistics::default()
        };
        let when = Utc.with_ymd_and_hms(2026, 8, 29, 9, 0, 0).unwrap();

        let with = render("alice", &stats, when, Some("Talks in riddles."));
        assert!(with.contains("Personal report for alice (2026-08-29)"));
        assert!(with.contains("messages: 12"));
        assert!(with.contains("Portrait\nTalks in riddles."));

        let without = render("alice", &stats, when, None);
        assert!(without.contains("Not enough chat for a portrait yet."));
        assert!(!without.contains("Portrait\n"));
    }
}
