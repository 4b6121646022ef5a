use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// One message of room history, normalized by the adapter. Immutable once
/// ingested; owned by the filter's working set for the duration of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Emote,
    Media,
    System,
}

/// The five analysis sub-tasks. `Statistics` is computed locally; the rest
/// are LLM-backed and independently throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Statistics,
    Topic,
    UserTitle,
    GoldenQuote,
    DialoguePoll,
}

impl AnalysisKind {
    /// Fixed section order for result assembly, regardless of completion order.
    pub const ORDERED: [AnalysisKind; 5] = [
        AnalysisKind::Statistics,
        AnalysisKind::Topic,
        AnalysisKind::UserTitle,
        AnalysisKind::GoldenQuote,
        AnalysisKind::DialoguePoll,
    ];

    pub fn is_llm_backed(self) -> bool {
        !matches!(self, AnalysisKind::Statistics)
    }

    pub fn label(self) -> &'static str {
        match self {
            AnalysisKind::Statistics => "statistics",
            AnalysisKind::Topic => "topic",
            AnalysisKind::UserTitle => "user_title",
            AnalysisKind::GoldenQuote => "golden_quote",
            AnalysisKind::DialoguePoll => "dialogue_poll",
        }
    }

    /// The kinds a full report run requests (everything but the poll, which
    /// has its own command).
    pub fn report_kinds() -> BTreeSet<AnalysisKind> {
        [
            AnalysisKind::Statistics,
            AnalysisKind::Topic,
            AnalysisKind::UserTitle,
            AnalysisKind::GoldenQuote,
        ]
        .into_iter()
        .collect()
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One job produces exactly one `AnalysisResult` or a terminal failure.
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub room_id: String,
    pub requested_at: DateTime<Utc>,
    pub spec: crate::history::FilterSpec,
    pub kinds: BTreeSet<AnalysisKind>,
    /// Free-form theme for the dialogue poll, from the requesting user.
    pub poll_guidance: Option<String>,
}

/// Aggregate token accounting across all LLM-backed kinds in one job.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn merge(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserActivity {
    pub user_id: String,
    pub name: String,
    pub message_count: usize,
    pub char_count: usize,
    pub emoji_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub message_count: usize,
    pub participant_count: usize,
    pub char_count: usize,
    pub emoji_count: usize,
    /// Message count per hour of day, local time.
    pub hourly: [u32; 24],
    pub most_active_period: String,
    pub top_users: Vec<UserActivity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub topic: String,
    pub contributors: Vec<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTitle {
    pub name: String,
    pub title: String,
    pub mbti: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenQuote {
    pub content: String,
    pub sender: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll {
    pub question: String,
    pub options: Vec<String>,
}

/// Assembled incrementally by the pipeline. Partially complete results are
/// valid: sections listed in `unavailable` render as "unavailable" rather
/// than failing the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub room_id: String,
    pub generated_at: DateTime<Utc>,
    pub statistics: Option<Statistics>,
    pub topics: Vec<Topic>,
    pub titles: Vec<UserTitle>,
    pub quotes: Vec<GoldenQuote>,
    pub poll: Option<Poll>,
    pub unavailable: BTreeSet<AnalysisKind>,
    pub token_usage: TokenUsage,
}

impl AnalysisResult {
    pub fn empty(room_id: &str, generated_at: DateTime<Utc>) -> Self {
        Self {
            room_id: room_id.to_string(),
            generated_at,
            statistics: None,
            topics: Vec::new(),
            titles: Vec::new(),
            quotes: Vec::new(),
            poll: None,
            unavailable: BTreeSet::new(),
            token_usage: TokenUsage::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Image,
    Text,
    Pdf,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Option<OutputFormat> {
        match s.to_ascii_lowercase().as_str() {
            "image" => Some(OutputFormat::Image),
            "text" => Some(OutputFormat::Text),
            "pdf" => Some(OutputFormat::Pdf),
            _ => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::Image => "image",
            OutputFormat::Text => "text",
            OutputFormat::Pdf => "pdf",
        })
    }
}

#[derive(Debug, Clone)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Bytes(b) => b.len(),
            Payload::Text(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transient render product, consumed once by the delivery manager.
#[derive(Debug, Clone)]
pub struct RenderedReport {
    pub room_id: String,
    pub format: OutputFormat,
    pub payload: Payload,
    pub template_id: String,
}
