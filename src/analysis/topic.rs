use crate::analysis::json::{parse_object_array, str_field};
use crate::config::TopicSettings;
use crate::model::Topic;
use serde_json::Value;

const DEFAULT_PROMPT: &str = "You are a chat-history analyst. From the room history below, \
identify up to {max_topics} distinct discussion topics. For each topic give a short name, \
the participants who drove it, and a two-sentence summary of what was said. \
Output ONLY a JSON array in this exact shape: \
[{\"topic\":\"...\",\"contributors\":[\"...\"],\"detail\":\"...\"}]\n\nHistory:\n{history}";

pub fn build_prompt(settings: &TopicSettings, history: &str) -> String {
    let template = settings.prompt.as_deref().unwrap_or(DEFAULT_PROMPT);
    template
        .replace("{max_topics}", &settings.max_topics.to_string())
        .replace("{history}", history)
}

pub fn parse(text: &str, max_topics: usize) -> Vec<Topic> {
    let Some(items) = parse_object_array(text) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(topic_from_value)
        .take(max_topics)
        .collect()
}

fn topic_from_value(value: &Value) -> Option<Topic> {
    let topic = str_field(value, "topic");
    if topic.is_empty() {
        return None;
    }
    let contributors = value
        .get("contributors")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    Some(Topic {
        topic,
        contributors,
        detail: str_field(value, "detail"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_substitutes_placeholders() {
        let settings = TopicSettings::default();
        let prompt = build_prompt(&settings, "[09:00] alice: hi");
        assert!(prompt.contains("up to 5 distinct"));
        assert!(prompt.contains("[09:00] alice: hi"));
        assert!(!prompt.contains("{history}"));
    }

    #[test]
    fn parses_and_caps_topics() {
        let text = r#"Here are the topics:
        [
          {"topic": "release planning", "contributors": ["alice", "bob"], "detail": "Discussed the v2 cut."},
          {"topic": "lunch", "contributors": ["carol"], "detail": "Debated noodles."},
          {"topic": "noise", "contributors": [], "detail": ""}
        ]"#;
        let topics = parse(text, 2);
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[0].topic, "release planning");
        assert_eq!(topics[0].contributors, vec!["alice", "bob"]);
    }

    #[test]
    fn skips_entries_without_topic() {
        let text = r#"[{"detail": "orphan"}, {"topic": "real", "detail": "x"}]"#;
        let topics = parse(text, 5);
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].topic, "real");
    }

    #[test]
    fn garbage_yields_empty() {
        assert!(parse("the model refused", 5).is_empty());
    }
}
