use crate::config::Settings;
use crate::error::PipelineError;
use crate::model::{Message, MessageKind};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use tracing::debug;

pub const MIN_WINDOW_DAYS: i64 = 1;
pub const MAX_WINDOW_DAYS: i64 = 7;

/// Filtering rules for one analysis run. `window_days` is clamped to
/// [1, 7]; `max_messages` caps the retained set with most-recent-first
/// truncation.
#[derive(Debug, Clone)]
pub struct FilterSpec {
    pub prefixes: BTreeSet<String>,
    pub excluded_users: BTreeSet<String>,
    pub skip_bots: bool,
    pub window_days: i64,
    pub max_messages: usize,
}

impl FilterSpec {
    pub fn new(window_days: i64, max_messages: usize) -> Self {
        Self {
            prefixes: BTreeSet::new(),
            excluded_users: BTreeSet::new(),
            skip_bots: false,
            window_days: window_days.clamp(MIN_WINDOW_DAYS, MAX_WINDOW_DAYS),
            max_messages,
        }
    }

    /// Builds a spec from service settings. A `days` override outside the
    /// valid range falls back to the configured default.
    pub fn from_settings(settings: &Settings, days: Option<i64>) -> Self {
        let days = match days {
            Some(d) if (MIN_WINDOW_DAYS..=MAX_WINDOW_DAYS).contains(&d) => d,
            _ => settings.analysis.days,
        };
        let filters = &settings.analysis.history_filters;
        Self {
            prefixes: filters
                .prefixes
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| p.trim().to_lowercase())
                .collect(),
            excluded_users: filters
                .excluded_users
                .iter()
                .filter(|u| !u.trim().is_empty())
                .map(|u| u.trim().to_lowercase())
                .collect(),
            skip_bots: filters.skip_bots,
            window_days: days.clamp(MIN_WINDOW_DAYS, MAX_WINDOW_DAYS),
            max_messages: settings.analysis.max_messages,
        }
    }

    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.window_days)
    }
}

/// Normalizes and filters raw room history per a `FilterSpec`.
pub struct HistoryFilter {
    spec: FilterSpec,
    bot_ids: BTreeSet<String>,
    min_messages: usize,
}

impl HistoryFilter {
    pub fn new(spec: FilterSpec, bot_ids: &[String], min_messages: usize) -> Self {
        Self {
            spec,
            bot_ids: bot_ids.iter().map(|b| b.to_lowercase()).collect(),
            min_messages,
        }
    }

    /// Returns the retained messages ordered newest-last, or
    /// `InsufficientData` when fewer than the threshold survive. The
    /// threshold check happens before any LLM spend.
    pub fn filter(
        &self,
        now: DateTime<Utc>,
        raw: Vec<Message>,
    ) -> Result<Vec<Message>, PipelineError> {
        let start = self.spec.window_start(now);
        let mut kept: Vec<Message> = raw
            .into_iter()
            .filter(|m| m.timestamp >= start && m.timestamp <= now)
            .filter(|m| self.retains(m))
            .collect();

        kept.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        // Deterministic truncation: drop the oldest first.
        if kept.len() > self.spec.max_messages {
            let excess = kept.len() - self.spec.max_messages;
            kept.drain(..excess);
            debug!(dropped = excess, "history truncated to max_messages");
        }

        if kept.len() < self.min_messages {
            return Err(PipelineError::InsufficientData {
                got: kept.len(),
                needed: self.min_messages,
            });
        }
        Ok(kept)
    }

    fn retains(&self, message: &Message) -> bool {
        if message.kind == MessageKind::System {
            return false;
        }
        let sender = message.sender_id.to_lowercase();
        if self.spec.excluded_users.contains(&sender) {
            return false;
        }
        if self.spec.skip_bots && self.bot_ids.contains(&sender) {
            return false;
        }
        let body = message.body.trim_start().to_lowercase();
        if self
            .spec
            .prefixes
            .iter()
            .any(|prefix| body.starts_with(prefix))
        {
            return false;
        }
        true
    }
}
