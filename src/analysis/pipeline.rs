//! Fans one analysis job out into per-kind LLM calls, each independently
//! throttled and retried, and assembles whatever came back into a single
//! result. A kind that fails its whole retry budget becomes an
//! "unavailable" section; it never aborts the job.

use crate::adapter::ChatAdapter;
use crate::analysis::{
    dialogue_poll, format_history, golden_quote, personal_report, statistics, topic, user_title,
};
use crate::config::Settings;
use crate::error::PipelineError;
use crate::history::HistoryFilter;
use crate::llm::{CompletionRequest, Orchestrator, ProviderRegistry};
use crate::model::{
    AnalysisJob, AnalysisKind, AnalysisResult, GoldenQuote, Poll, Statistics, TokenUsage, Topic,
    UserTitle,
};
use crate::throttle::Throttler;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const LLM_TEMPERATURE: f32 = 0.7;

/// Job lifecycle, for log correlation. Transitions are strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Filtering,
    Dispatching,
    Awaiting,
    Assembling,
    Completed,
    Aborted,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Pending => "pending",
            State::Filtering => "filtering",
            State::Dispatching => "dispatching",
            State::Awaiting => "awaiting",
            State::Assembling => "assembling",
            State::Completed => "completed",
            State::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

enum KindOutput {
    Topics(Vec<Topic>),
    Titles(Vec<UserTitle>),
    Quotes(Vec<GoldenQuote>),
    Poll(Option<Poll>),
}

pub struct AnalysisPipeline {
    settings: Arc<Settings>,
    throttler: Throttler,
    orchestrator: Orchestrator,
    providers: Arc<ProviderRegistry>,
}

impl AnalysisPipeline {
    pub fn new(
        settings: Arc<Settings>,
        throttler: Throttler,
        orchestrator: Orchestrator,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            settings,
            throttler,
            orchestrator,
            providers,
        }
    }

    /// Runs one job to completion. Fails only when the history cannot be
    /// fetched or is too thin to analyze; per-kind LLM failures degrade the
    /// result instead.
    pub async fn run(
        &self,
        adapter: &dyn ChatAdapter,
        job: AnalysisJob,
    ) -> Result<AnalysisResult, PipelineError> {
        let room = job.room_id.clone();
        let mut state = State::Pending;

        state = self.advance(&room, state, State::Filtering);
        let since = job.spec.window_start(job.requested_at);
        let raw = adapter
            .fetch_history(&room, since, job.spec.max_messages)
            .await
            .map_err(|e| {
                self.advance(&room, state, State::Aborted);
                PipelineError::History(e.to_string())
            })?;

        let filter = HistoryFilter::new(
            job.spec.clone(),
            &self.settings.auto_analysis.bot_ids,
            self.settings.analysis.min_messages_threshold,
        );
        let messages = match filter.filter(job.requested_at, raw) {
            Ok(messages) => messages,
            Err(e) => {
                self.advance(&room, state, State::Aborted);
                return Err(e);
            }
        };
        debug!(room, count = messages.len(), "history filtered");

        let mut result = AnalysisResult::empty(&room, job.requested_at);

        let bot_ids: BTreeSet<String> = self
            .settings
            .auto_analysis
            .bot_ids
            .iter()
            .map(|b| b.to_lowercase())
            .collect();
        let stats = statistics::compute(&messages, &bot_ids);
        if job.kinds.contains(&AnalysisKind::Statistics) {
            result.statistics = Some(stats.clone());
        }

        state = self.advance(&room, state, State::Dispatching);
        let history = Arc::new(format_history(&messages));
        let mut tasks: JoinSet<(AnalysisKind, Result<(KindOutput, TokenUsage), String>)> =
            JoinSet::new();
        for kind in AnalysisKind::ORDERED {
            if !kind.is_llm_backed() || !job.kinds.contains(&kind) {
                continue;
            }
            if !self.kind_enabled(kind) {
                debug!(room, %kind, "analysis kind disabled, skipping");
                continue;
            }
            let task = self.kind_task(kind, &job, &stats, Arc::clone(&history));
            tasks.spawn(async move { (kind, task.await) });
        }

        state = self.advance(&room, state, State::Awaiting);
        let mut outputs = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((kind, Ok((output, usage)))) => {
                    result.token_usage.merge(usage);
                    outputs.push((kind, output));
                }
                Ok((kind, Err(reason))) => {
                    warn!(room, %kind, reason, "analysis kind unavailable");
                    result.unavailable.insert(kind);
                }
                Err(join_error) => {
                    warn!(room, error = %join_error, "analysis task panicked");
                }
            }
        }

        state = self.advance(&room, state, State::Assembling);
        // Completion order is arbitrary; sections land in fixed order.
        outputs.sort_by_key(|(kind, _)| *kind);
        for (kind, output) in outputs {
            match output {
                KindOutput::Topics(topics) => result.topics = topics,
                KindOutput::Titles(titles) => result.titles = titles,
                KindOutput::Quotes(quotes) => result.quotes = quotes,
                KindOutput::Poll(Some(poll)) => result.poll = Some(poll),
                KindOutput::Poll(None) => {
                    warn!(room, "poll output unusable after normalization");
                    result.unavailable.insert(kind);
                }
            }
        }

        self.advance(&room, state, State::Completed);
        info!(
            room,
            unavailable = result.unavailable.len(),
            tokens = result.token_usage.total_tokens,
            "analysis complete"
        );
        Ok(result)
    }

    /// Profile of one member: their own slice of the filtered history,
    /// local counters, and a single throttled LLM pass. Degrades to the
    /// counters alone when the member wrote too little or the call fails.
    pub async fn run_personal(
        &self,
        adapter: &dyn ChatAdapter,
        room_id: &str,
        sender_id: &str,
        job: AnalysisJob,
    ) -> Result<String, PipelineError> {
        let since = job.spec.window_start(job.requested_at);
        let raw = adapter
            .fetch_history(room_id, since, job.spec.max_messages)
            .await
            .map_err(|e| PipelineError::History(e.to_string()))?;

        // The room-wide threshold does not apply: one member's profile is
        // useful even on a quiet day.
        let filter = HistoryFilter::new(job.spec.clone(), &self.settings.auto_analysis.bot_ids, 1);
        let messages = filter.filter(job.requested_at, raw)?;

        let wanted = sender_id.to_lowercase();
        let own: Vec<_> = messages
            .into_iter()
            .filter(|m| m.sender_id.to_lowercase() == wanted)
            .collect();
        if own.is_empty() {
            return Err(PipelineError::InsufficientData { got: 0, needed: 1 });
        }

        let stats = statistics::compute(&own, &BTreeSet::new());
        let display_name = own
            .last()
            .map(|m| m.sender_name.clone())
            .unwrap_or_else(|| sender_id.to_string());

        let config = &self.settings.analysis.personal_report;
        let texts = personal_report::sample_texts(&own, config.max_messages);
        let portrait = if config.enabled && !texts.is_empty() {
            self.personal_portrait(config, &texts, room_id).await
        } else {
            None
        };

        Ok(personal_report::render(
            &display_name,
            &stats,
            job.requested_at,
            portrait.as_deref(),
        ))
    }

    async fn personal_portrait(
        &self,
        config: &crate::config::PersonalReportSettings,
        texts: &[String],
        room_id: &str,
    ) -> Option<String> {
        let provider = match self.providers.resolve(config.provider_id.as_deref()) {
            Ok(provider) => provider,
            Err(e) => {
                warn!(room = room_id, error = %e, "personal report provider missing");
                return None;
            }
        };
        let _slot = self.throttler.acquire().await;
        match self
            .orchestrator
            .call(
                provider.as_ref(),
                CompletionRequest {
                    prompt: personal_report::build_prompt(config, texts),
                    max_tokens: config.max_tokens,
                    temperature: LLM_TEMPERATURE,
                },
            )
            .await
        {
            Ok(completion) => Some(completion.text),
            Err(e) => {
                warn!(room = room_id, error = %e, "personal portrait failed, counters only");
                None
            }
        }
    }

    fn kind_enabled(&self, kind: AnalysisKind) -> bool {
        let analysis = &self.settings.analysis;
        match kind {
            AnalysisKind::Statistics => true,
            AnalysisKind::Topic => analysis.topic.enabled,
            AnalysisKind::UserTitle => analysis.user_title.enabled,
            AnalysisKind::GoldenQuote => analysis.golden_quote.enabled,
            AnalysisKind::DialoguePoll => analysis.dialogue_poll.enabled,
        }
    }

    /// Builds the future for one LLM-backed kind. The throttler slot is held
    /// for the whole call, retries included, and released on every exit path.
    fn kind_task(
        &self,
        kind: AnalysisKind,
        job: &AnalysisJob,
        stats: &Statistics,
        history: Arc<String>,
    ) -> impl std::future::Future<Output = Result<(KindOutput, TokenUsage), String>> + Send + 'static
    {
        let settings = Arc::clone(&self.settings);
        let throttler = self.throttler.clone();
        let orchestrator = self.orchestrator.clone();
        let providers = Arc::clone(&self.providers);
        let stats = stats.clone();
        let guidance = job.poll_guidance.clone();

        async move {
            let analysis = &settings.analysis;
            let (prompt, max_tokens, provider_id) = match kind {
                AnalysisKind::Topic => (
                    topic::build_prompt(&analysis.topic, &history),
                    analysis.topic.max_tokens,
                    analysis.topic.provider_id.clone(),
                ),
                AnalysisKind::UserTitle => (
                    user_title::build_prompt(&analysis.user_title, &stats, &history),
                    analysis.user_title.max_tokens,
                    analysis.user_title.provider_id.clone(),
                ),
                AnalysisKind::GoldenQuote => (
                    golden_quote::build_prompt(&analysis.golden_quote, &history),
                    analysis.golden_quote.max_tokens,
                    analysis.golden_quote.provider_id.clone(),
                ),
                AnalysisKind::DialoguePoll => (
                    dialogue_poll::build_prompt(
                        &analysis.dialogue_poll,
                        guidance.as_deref(),
                        &history,
                    ),
                    analysis.dialogue_poll.max_tokens,
                    analysis.dialogue_poll.provider_id.clone(),
                ),
                AnalysisKind::Statistics => unreachable!("statistics is not llm-backed"),
            };

            let provider = providers
                .resolve(provider_id.as_deref())
                .map_err(|e| e.to_string())?;

            let _slot = throttler.acquire().await;
            let completion = orchestrator
                .call(
                    provider.as_ref(),
                    CompletionRequest {
                        prompt,
                        max_tokens,
                        temperature: LLM_TEMPERATURE,
                    },
                )
                .await
                .map_err(|e| e.to_string())?;

            let output = match kind {
                AnalysisKind::Topic => {
                    KindOutput::Topics(topic::parse(&completion.text, analysis.topic.max_topics))
                }
                AnalysisKind::UserTitle => KindOutput::Titles(user_title::parse(
                    &completion.text,
                    analysis.user_title.max_titles,
                )),
                AnalysisKind::GoldenQuote => KindOutput::Quotes(golden_quote::parse(
                    &completion.text,
                    analysis.golden_quote.max_quotes,
                )),
                AnalysisKind::DialoguePoll => KindOutput::Poll(dialogue_poll::parse(
                    &completion.text,
                    analysis.dialogue_poll.max_options,
                )),
                AnalysisKind::Statistics => unreachable!(),
            };
            Ok((output, completion.usage))
        }
    }

    fn advance(&self, room: &str, from: State, to: State) -> State {
        debug!(room, %from, %to, "pipeline state");
        to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Artifact, MediaRef, SendOutcome};
    use crate::error::LlmError;
    use crate::history::FilterSpec;
    use crate::llm::{Completion, LlmProvider};
    use crate::model::{Message, MessageKind};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CannedAdapter {
        messages: Vec<Message>,
    }

    #[async_trait]
    impl ChatAdapter for CannedAdapter {
        async fn fetch_history(
            &self,
            _room_id: &str,
            _since: DateTime<Utc>,
            _limit: usize,
        ) -> anyhow::Result<Vec<Message>> {
            Ok(self.messages.clone())
        }

        async fn send(&self, _room_id: &str, _artifact: &Artifact) -> SendOutcome {
            SendOutcome::Delivered
        }

        async fn upload(
            &self,
            _bytes: &[u8],
            _mime: &str,
            _filename: &str,
        ) -> anyhow::Result<MediaRef> {
            anyhow::bail!("not used")
        }
    }

    /// Answers every prompt with a payload valid for whichever kind asked.
    struct UniversalProvider {
        calls: AtomicUsize,
        fail_quotes: bool,
    }

    #[async_trait]
    impl LlmProvider for UniversalProvider {
        fn id(&self) -> &str {
            "default"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = if request.prompt.contains("discussion topics") {
                r#"[{"topic": "rust", "contributors": ["alice"], "detail": "ownership"}]"#
            } else if request.prompt.contains("honorary title") {
                r#"[{"name": "alice", "title": "Compiler Whisperer", "mbti": "INTJ", "reason": "fixed the build"}]"#
            } else if request.prompt.contains("memorable quotes") {
                if self.fail_quotes {
                    return Err(LlmError::BadRequest("quota".into()));
                }
                r#"[{"content": "ship it", "sender": "bob", "reason": "bold"}]"#
            } else {
                r#"{"question": "Best moment?", "options": ["deploy", "rollback"]}"#
            };
            Ok(Completion {
                text: text.to_string(),
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
            })
        }
    }

    fn history(count: usize) -> Vec<Message> {
        (0..count)
            .map(|i| Message {
                id: i.to_string(),
                room_id: "!room:x".to_string(),
                sender_id: if i % 2 == 0 { "@alice:x" } else { "@bob:x" }.to_string(),
                sender_name: if i % 2 == 0 { "alice" } else { "bob" }.to_string(),
                timestamp: Utc::now() - Duration::minutes(i as i64),
                body: format!("message {i}"),
                kind: MessageKind::Text,
            })
            .collect()
    }

    fn pipeline(fail_quotes: bool) -> (AnalysisPipeline, Arc<UniversalProvider>) {
        let mut settings = Settings::default();
        settings.analysis.min_messages_threshold = 5;
        let provider = Arc::new(UniversalProvider {
            calls: AtomicUsize::new(0),
            fail_quotes,
        });
        let mut registry = ProviderRegistry::new("default");
        registry.register(provider.clone());
        let settings = Arc::new(settings);
        (
            AnalysisPipeline::new(
                Arc::clone(&settings),
                Throttler::new(settings.analysis.max_concurrent_tasks),
                Orchestrator::from_settings(&settings.llm),
                Arc::new(registry),
            ),
            provider,
        )
    }

    fn job(kinds: BTreeSet<AnalysisKind>) -> AnalysisJob {
        AnalysisJob {
            room_id: "!room:x".to_string(),
            requested_at: Utc::now(),
            spec: FilterSpec::new(1, 1000),
            kinds,
            poll_guidance: None,
        }
    }

    #[tokio::test]
    async fn full_report_run_assembles_all_sections() {
        let (pipeline, provider) = pipeline(false);
        let adapter = CannedAdapter {
            messages: history(20),
        };
        let result = pipeline
            .run(&adapter, job(AnalysisKind::report_kinds()))
            .await
            .unwrap();

        assert_eq!(result.statistics.as_ref().unwrap().message_count, 20);
        assert_eq!(result.topics[0].topic, "rust");
        assert_eq!(result.titles[0].title, "Compiler Whisperer");
        assert_eq!(result.quotes[0].content, "ship it");
        assert!(result.poll.is_none());
        assert!(result.unavailable.is_empty());
        // Three LLM kinds, one call each, usage merged.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.token_usage.total_tokens, 45);
    }

    #[tokio::test]
    async fn failed_kind_degrades_not_aborts() {
        let (pipeline, _) = pipeline(true);
        let adapter = CannedAdapter {
            messages: history(20),
        };
        let result = pipeline
            .run(&adapter, job(AnalysisKind::report_kinds()))
            .await
            .unwrap();

        assert!(result.unavailable.contains(&AnalysisKind::GoldenQuote));
        assert!(result.quotes.is_empty());
        // The siblings still landed.
        assert_eq!(result.topics.len(), 1);
        assert_eq!(result.titles.len(), 1);
    }

    #[tokio::test]
    async fn thin_history_aborts_before_any_llm_call() {
        let (pipeline, provider) = pipeline(false);
        let adapter = CannedAdapter {
            messages: history(3),
        };
        let err = pipeline
            .run(&adapter, job(AnalysisKind::report_kinds()))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::InsufficientData { got: 3, needed: 5 }
        ));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn poll_only_job() {
        let (pipeline, provider) = pipeline(false);
        let adapter = CannedAdapter {
            messages: history(20),
        };
        let kinds: BTreeSet<AnalysisKind> = [AnalysisKind::DialoguePoll].into_iter().collect();
        let result = pipeline.run(&adapter, job(kinds)).await.unwrap();

        let poll = result.poll.unwrap();
        assert_eq!(poll.options, vec!["deploy", "rollback"]);
        assert!(result.statistics.is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
