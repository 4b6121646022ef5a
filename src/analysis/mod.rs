//! The five analysis kinds and the pipeline that fans them out.

use crate::model::Message;
use std::fmt::Write;

pub mod dialogue_poll;
pub mod golden_quote;
pub mod json;
pub mod personal_report;
pub mod pipeline;
pub mod statistics;
pub mod topic;
pub mod user_title;

pub use pipeline::AnalysisPipeline;

const BODY_MAX_CHARS: usize = 80;

/// Renders filtered history as prompt input, one line per message. Long
/// bodies are truncated so a single rant cannot crowd out the rest of the
/// day within the model's context.
pub fn format_history(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        let _ = writeln!(
            out,
            "[{}] {}: {}",
            message.timestamp.format("%H:%M"),
            message.sender_name,
            truncate_body(&message.body)
        );
    }
    out
}

fn truncate_body(body: &str) -> String {
    let flat = body.replace(['\n', '\r'], " ");
    if flat.chars().count() <= BODY_MAX_CHARS {
        return flat;
    }
    let head: String = flat.chars().take(BODY_MAX_CHARS - 3).collect();
    format!("{head}...")
}
