use crate::config::{BackoffSettings, LlmSettings};
use crate::error::{LlmError, LlmFailure};
use crate::model::TokenUsage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub mod openai;

pub use openai::OpenAiProvider;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// One upstream LLM endpoint. Implementations classify their own failures
/// into the transient/terminal taxonomy so the orchestrator can decide
/// whether to retry.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError>;
}

/// Named providers plus a default; per-kind `provider_id` overrides resolve
/// here.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    default_id: String,
}

impl ProviderRegistry {
    pub fn new(default_id: &str) -> Self {
        Self {
            providers: HashMap::new(),
            default_id: default_id.to_string(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn resolve(&self, provider_id: Option<&str>) -> Result<Arc<dyn LlmProvider>, LlmError> {
        let id = provider_id.unwrap_or(&self.default_id);
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| LlmError::UnknownProvider(id.to_string()))
    }
}

/// Delay policy between retry attempts of a failed transient call.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    Fixed {
        delay: Duration,
    },
    Exponential {
        base: Duration,
        multiplier: f64,
        cap: Duration,
    },
}

impl Backoff {
    pub fn from_settings(settings: &BackoffSettings) -> Self {
        match *settings {
            BackoffSettings::Fixed { delay_secs } => Backoff::Fixed {
                delay: Duration::from_secs(delay_secs),
            },
            BackoffSettings::Exponential {
                base_secs,
                multiplier,
                cap_secs,
            } => Backoff::Exponential {
                base: Duration::from_secs(base_secs),
                multiplier,
                cap: Duration::from_secs(cap_secs),
            },
        }
    }

    /// Delay after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential {
                base,
                multiplier,
                cap,
            } => {
                let scaled = base.as_secs_f64() * multiplier.powi(attempt as i32);
                Duration::from_secs_f64(scaled.min(cap.as_secs_f64()))
            }
        }
    }
}

/// Wraps a single provider call with a hard timeout, a bounded retry budget
/// and backoff between attempts. Retries only transient failures; malformed
/// requests and auth errors fail immediately. Each call is independent.
#[derive(Clone)]
pub struct Orchestrator {
    timeout: Duration,
    retries: u32,
    backoff: Backoff,
}

impl Orchestrator {
    pub fn new(timeout: Duration, retries: u32, backoff: Backoff) -> Self {
        Self {
            timeout,
            retries,
            backoff,
        }
    }

    pub fn from_settings(settings: &LlmSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.timeout_secs),
            settings.retries,
            Backoff::from_settings(&settings.backoff),
        )
    }

    pub async fn call(
        &self,
        provider: &dyn LlmProvider,
        request: CompletionRequest,
    ) -> Result<Completion, LlmFailure> {
        let mut attempt = 0u32;
        loop {
            let error = match tokio::time::timeout(self.timeout, provider.complete(request.clone()))
                .await
            {
                Ok(Ok(completion)) => {
                    debug!(
                        provider = provider.id(),
                        attempts = attempt + 1,
                        tokens = completion.usage.total_tokens,
                        "llm call succeeded"
                    );
                    return Ok(completion);
                }
                Ok(Err(e)) => e,
                Err(_) => LlmError::Timeout(self.timeout),
            };

            if !error.is_transient() || attempt >= self.retries {
                return Err(LlmFailure {
                    attempts: attempt + 1,
                    last_error: error,
                });
            }

            let delay = self.backoff.delay_for(attempt);
            warn!(
                provider = provider.id(),
                attempt = attempt + 1,
                ?delay,
                error = %error,
                "transient llm failure, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct ScriptedProvider {
        outcomes: Mutex<Vec<Result<&'static str, LlmError>>>,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(outcomes: Vec<Result<&'static str, LlmError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<Completion, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            match outcomes.remove(0) {
                Ok(text) => Ok(Completion {
                    text: text.to_string(),
                    usage: TokenUsage::default(),
                }),
                Err(e) => Err(e),
            }
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            prompt: "hello".to_string(),
            max_tokens: 32,
            temperature: 0.7,
        }
    }

    #[test]
    fn backoff_schedules() {
        let fixed = Backoff::Fixed {
            delay: Duration::from_secs(1),
        };
        assert_eq!(fixed.delay_for(0), Duration::from_secs(1));
        assert_eq!(fixed.delay_for(5), Duration::from_secs(1));

        let exp = Backoff::Exponential {
            base: Duration::from_secs(2),
            multiplier: 2.0,
            cap: Duration::from_secs(10),
        };
        assert_eq!(exp.delay_for(0), Duration::from_secs(2));
        assert_eq!(exp.delay_for(1), Duration::from_secs(4));
        assert_eq!(exp.delay_for(2), Duration::from_secs(8));
        // Capped from here on.
        assert_eq!(exp.delay_for(3), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds_after_two_delays() {
        let provider = ScriptedProvider::new(vec![
            Err(LlmError::Network("reset".into())),
            Err(LlmError::RateLimited("429".into())),
            Ok("third time lucky"),
        ]);
        let orchestrator = Orchestrator::new(
            Duration::from_secs(30),
            2,
            Backoff::Fixed {
                delay: Duration::from_secs(1),
            },
        );

        let before = tokio::time::Instant::now();
        let completion = orchestrator.call(&provider, request()).await.unwrap();
        assert_eq!(completion.text, "third time lucky");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        // Exactly two backoff delays elapsed.
        assert_eq!(before.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn terminal_error_fails_immediately() {
        let provider = ScriptedProvider::new(vec![Err(LlmError::Auth("bad key".into()))]);
        let orchestrator = Orchestrator::new(
            Duration::from_secs(30),
            5,
            Backoff::Fixed {
                delay: Duration::from_secs(1),
            },
        );
        let failure = orchestrator.call(&provider, request()).await.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert!(matches!(failure.last_error, LlmError::Auth(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempts() {
        let provider = ScriptedProvider::new(vec![
            Err(LlmError::Network("a".into())),
            Err(LlmError::Network("b".into())),
            Err(LlmError::Network("c".into())),
        ]);
        let orchestrator = Orchestrator::new(
            Duration::from_secs(30),
            2,
            Backoff::Fixed {
                delay: Duration::from_millis(10),
            },
        );
        let failure = orchestrator.call(&provider, request()).await.unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert!(failure.last_error.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_provider_hits_timeout() {
        struct HangingProvider;

        #[async_trait]
        impl LlmProvider for HangingProvider {
            fn id(&self) -> &str {
                "hanging"
            }
            async fn complete(&self, _r: CompletionRequest) -> Result<Completion, LlmError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }
        }

        let orchestrator = Orchestrator::new(
            Duration::from_secs(5),
            0,
            Backoff::Fixed {
                delay: Duration::from_secs(1),
            },
        );
        let failure = orchestrator
            .call(&HangingProvider, request())
            .await
            .unwrap_err();
        assert!(matches!(failure.last_error, LlmError::Timeout(_)));
    }

    #[test]
    fn registry_resolves_default_and_overrides() {
        let mut registry = ProviderRegistry::new("main");
        registry.register(Arc::new(ScriptedProvider::new(vec![])) as Arc<dyn LlmProvider>);
        assert!(registry.resolve(Some("scripted")).is_ok());
        assert!(matches!(
            registry.resolve(None),
            Err(LlmError::UnknownProvider(id)) if id == "main"
        ));
    }
}
