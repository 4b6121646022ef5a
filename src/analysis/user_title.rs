use crate::analysis::json::{parse_object_array, str_field};
use crate::config::UserTitleSettings;
use crate::model::{Statistics, UserTitle};
use serde_json::Value;
use std::fmt::Write;

const DEFAULT_PROMPT: &str = "You are a chat-history analyst. Based on the activity summary and \
history below, award each of the most active members a playful honorary title and an MBTI-style \
type guess, with a one-sentence justification grounded in what they actually wrote. At most \
{max_titles} members. Output ONLY a JSON array in this exact shape: \
[{\"name\":\"...\",\"title\":\"...\",\"mbti\":\"...\",\"reason\":\"...\"}]\n\n\
Activity summary:\n{activity}\n\nHistory:\n{history}";

pub fn build_prompt(settings: &UserTitleSettings, statistics: &Statistics, history: &str) -> String {
    let mut activity = String::new();
    for user in &statistics.top_users {
        let _ = writeln!(
            activity,
            "- {} ({}): {} messages, {} chars, {} emotes",
            user.name, user.user_id, user.message_count, user.char_count, user.emoji_count
        );
    }
    let template = settings.prompt.as_deref().unwrap_or(DEFAULT_PROMPT);
    template
        .replace("{max_titles}", &settings.max_titles.to_string())
        .replace("{activity}", &activity)
        .replace("{history}", history)
}

pub fn parse(text: &str, max_titles: usize) -> Vec<UserTitle> {
    let Some(items) = parse_object_array(text) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(title_from_value)
        .take(max_titles)
        .collect()
}

fn title_from_value(value: &Value) -> Option<UserTitle> {
    let name = str_field(value, "name");
    let title = str_field(value, "title");
    if name.is_empty() || title.is_empty() {
        return None;
    }
    Some(UserTitle {
        name,
        title,
        mbti: str_field(value, "mbti"),
        reason: str_field(value, "reason"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UserActivity;

    #[test]
    fn prompt_includes_activity_lines() {
        let stats = Statistics {
            top_users: vec![UserActivity {
                user_id: "@alice:x".to_string(),
                name: "alice".to_string(),
                message_count: 42,
                char_count: 900,
                emoji_count: 3,
            }],
            ..Statistics::default()
        };
        let prompt = build_prompt(&UserTitleSettings::default(), &stats, "history");
        assert!(prompt.contains("alice (@alice:x): 42 messages"));
        assert!(prompt.contains("At most 8 members"));
    }

    #[test]
    fn parses_titles_and_drops_incomplete() {
        let text = r#"[
            {"name": "alice", "title": "Night Owl", "mbti": "INTP", "reason": "posts at 3am"},
            {"name": "", "title": "Ghost", "mbti": "", "reason": ""}
        ]"#;
        let titles = parse(text, 8);
        assert_eq!(titles.len(), 1);
        assert_eq!(titles[0].title, "Night Owl");
        assert_eq!(titles[0].mbti, "INTP");
    }
}
