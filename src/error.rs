use std::time::Duration;
use thiserror::Error;

/// A single failed or rejected LLM call attempt.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("no provider configured for id {0:?}")]
    UnknownProvider(String),
}

impl LlmError {
    /// Transient failures are worth retrying; the rest fail fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout(_) | LlmError::RateLimited(_) | LlmError::Network(_)
        )
    }
}

/// Terminal outcome of an orchestrated LLM call once the retry budget is spent
/// (or the first non-retryable error is seen).
#[derive(Debug, Clone, Error)]
#[error("llm call failed after {attempts} attempt(s): {last_error}")]
pub struct LlmFailure {
    pub attempts: u32,
    pub last_error: LlmError,
}

/// Pipeline-level aborts. Per-kind LLM failures are contained inside the
/// pipeline and never surface here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("not enough messages to analyze ({got} collected, {needed} required)")]
    InsufficientData { got: usize, needed: usize },
    #[error("history fetch failed: {0}")]
    History(String),
}

#[derive(Debug, Error)]
pub enum RenderError {
    /// The requested format needs an external renderer that is not wired in.
    /// Carries remediation guidance for the user.
    #[error("renderer unavailable: {0}")]
    Unavailable(String),
    #[error("render failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("delivery failed: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl ConfigError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}
