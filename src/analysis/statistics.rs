//! The one analysis kind that never touches an LLM: per-user activity
//! counters, an hourly histogram and a top-user ranking, computed locally
//! from the filtered history.

use crate::model::{Message, MessageKind, Statistics, UserActivity};
use chrono::{Local, Timelike};
use std::collections::{BTreeSet, HashMap};

pub const TOP_USER_LIMIT: usize = 10;

pub fn compute(messages: &[Message], bot_ids: &BTreeSet<String>) -> Statistics {
    let mut per_user: HashMap<String, UserActivity> = HashMap::new();
    let mut hourly = [0u32; 24];
    let mut message_count = 0usize;
    let mut char_count = 0usize;
    let mut emoji_count = 0usize;

    for message in messages {
        let sender = message.sender_id.to_lowercase();
        if bot_ids.contains(&sender) {
            continue;
        }

        message_count += 1;
        // Histogram follows the reader's wall clock, not UTC.
        let hour = message.timestamp.with_timezone(&Local).hour() as usize;
        hourly[hour] += 1;

        let entry = per_user
            .entry(message.sender_id.clone())
            .or_insert_with(|| UserActivity {
                user_id: message.sender_id.clone(),
                name: message.sender_name.clone(),
                ..UserActivity::default()
            });
        entry.message_count += 1;
        if !message.sender_name.is_empty() {
            entry.name = message.sender_name.clone();
        }

        match message.kind {
            MessageKind::Text => {
                let chars = message.body.chars().count();
                entry.char_count += chars;
                char_count += chars;
            }
            MessageKind::Emote => {
                entry.emoji_count += 1;
                emoji_count += 1;
            }
            MessageKind::Media | MessageKind::System => {}
        }
    }

    let participant_count = per_user.len();
    let mut top_users: Vec<UserActivity> = per_user.into_values().collect();
    top_users.sort_by(|a, b| {
        b.message_count
            .cmp(&a.message_count)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    top_users.truncate(TOP_USER_LIMIT);

    Statistics {
        message_count,
        participant_count,
        char_count,
        emoji_count,
        most_active_period: most_active_period(&hourly).to_string(),
        hourly,
        top_users,
    }
}

fn most_active_period(hourly: &[u32; 24]) -> &'static str {
    let buckets = [
        ("night", 0..6),
        ("morning", 6..12),
        ("afternoon", 12..18),
        ("evening", 18..24),
    ];
    buckets
        .into_iter()
        .max_by_key(|(_, range)| hourly[range.clone()].iter().sum::<u32>())
        .map(|(label, _)| label)
        .unwrap_or("night")
}
