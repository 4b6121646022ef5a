pub mod adapter;
pub mod analysis;
pub mod commands;
pub mod config;
pub mod delivery;
pub mod error;
pub mod history;
pub mod llm;
pub mod model;
pub mod report;
pub mod scheduler;
pub mod store;
pub mod throttle;

use crate::adapter::{Artifact, ChatAdapter, SendOutcome};
use crate::analysis::AnalysisPipeline;
use crate::config::Settings;
use crate::delivery::{DeliveryManager, DeliveryStatus};
use crate::error::PipelineError;
use crate::history::FilterSpec;
use crate::model::{AnalysisJob, AnalysisKind, OutputFormat};
use crate::report::ReportRenderer;
use crate::scheduler::DailyJobRunner;
use crate::store::RoomConfigStore;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Everything a command handler or timer needs, wired once at startup.
pub struct Service {
    pub settings: Arc<Settings>,
    pub store: Arc<RoomConfigStore>,
    pub adapter: Arc<dyn ChatAdapter>,
    pub pipeline: AnalysisPipeline,
    pub renderer: ReportRenderer,
    pub delivery: DeliveryManager,
}

impl Service {
    /// Full analysis run for one room: filter, analyze, render, deliver.
    pub async fn run_analysis(
        &self,
        room_id: &str,
        days: Option<i64>,
    ) -> anyhow::Result<DeliveryStatus> {
        anyhow::ensure!(
            self.store.is_allowed(room_id),
            "room {room_id} is not allowed"
        );

        let result = self
            .pipeline
            .run(
                self.adapter.as_ref(),
                self.job(room_id, days, AnalysisKind::report_kinds(), None),
            )
            .await?;

        let overrides = self.store.overrides_for(room_id);
        let format = overrides
            .output_format
            .as_deref()
            .and_then(OutputFormat::parse)
            .or_else(|| OutputFormat::parse(&self.settings.output.format))
            .unwrap_or(OutputFormat::Text);
        let template_id = overrides
            .template_id
            .unwrap_or_else(|| self.settings.output.template.clone());

        let report = self.renderer.render(&result, format, &template_id).await?;
        let status = self.delivery.deliver(report, Arc::new(result)).await?;
        Ok(status)
    }

    /// Poll-only run. The poll goes out as a native poll event; if the room
    /// cannot take one, the question and options go out as text.
    pub async fn run_dialogue_poll(
        &self,
        room_id: &str,
        days: Option<i64>,
        guidance: Option<String>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.store.is_allowed(room_id),
            "room {room_id} is not allowed"
        );

        let kinds: BTreeSet<AnalysisKind> = [AnalysisKind::DialoguePoll].into_iter().collect();
        let result = self
            .pipeline
            .run(self.adapter.as_ref(), self.job(room_id, days, kinds, guidance))
            .await?;

        let Some(poll) = result.poll else {
            anyhow::bail!("no usable poll came out of today's history");
        };

        match self.adapter.send(room_id, &Artifact::Poll(poll.clone())).await {
            SendOutcome::Delivered => Ok(()),
            SendOutcome::Transient(reason) | SendOutcome::Fatal(reason) => {
                warn!(room = room_id, reason, "poll event rejected, sending as text");
                let text = poll_as_text(&poll);
                match self.adapter.send(room_id, &Artifact::Text(text)).await {
                    SendOutcome::Delivered => Ok(()),
                    SendOutcome::Transient(e) | SendOutcome::Fatal(e) => {
                        anyhow::bail!("poll fallback failed: {e}")
                    }
                }
            }
        }
    }

    /// Profile report for one member, returned as the reply text.
    pub async fn run_personal_report(
        &self,
        room_id: &str,
        sender_id: &str,
        days: Option<i64>,
    ) -> anyhow::Result<String> {
        anyhow::ensure!(
            self.store.is_allowed(room_id),
            "room {room_id} is not allowed"
        );
        let job = self.job(room_id, days, BTreeSet::new(), None);
        let report = self
            .pipeline
            .run_personal(self.adapter.as_ref(), room_id, sender_id, job)
            .await?;
        Ok(report)
    }

    fn job(
        &self,
        room_id: &str,
        days: Option<i64>,
        kinds: BTreeSet<AnalysisKind>,
        poll_guidance: Option<String>,
    ) -> AnalysisJob {
        AnalysisJob {
            room_id: room_id.to_string(),
            requested_at: Utc::now(),
            spec: FilterSpec::from_settings(&self.settings, days),
            kinds,
            poll_guidance,
        }
    }
}

fn poll_as_text(poll: &crate::model::Poll) -> String {
    let mut text = format!("{}\n", poll.question);
    for (i, option) in poll.options.iter().enumerate() {
        text.push_str(&format!("{}. {}\n", i + 1, option));
    }
    text
}

#[async_trait]
impl DailyJobRunner for Service {
    async fn run_daily(&self, room_id: &str) {
        match self.run_analysis(room_id, None).await {
            Ok(status) => info!(room = room_id, ?status, "scheduled analysis done"),
            Err(e) => match e.downcast_ref::<PipelineError>() {
                Some(PipelineError::InsufficientData { got, needed }) => {
                    info!(
                        room = room_id,
                        got, needed, "scheduled analysis skipped, too few messages"
                    );
                }
                _ => error!(room = room_id, error = %e, "scheduled analysis failed"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_text_fallback_numbers_options() {
        let poll = crate::model::Poll {
            question: "Best moment?".to_string(),
            options: vec!["deploy".to_string(), "rollback".to_string()],
        };
        let text = poll_as_text(&poll);
        assert!(text.starts_with("Best moment?\n"));
        assert!(text.contains("1. deploy"));
        assert!(text.contains("2. rollback"));
    }
}
