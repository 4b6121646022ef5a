use crate::config::ProviderSettings;
use crate::error::LlmError;
use crate::llm::{Completion, CompletionRequest, LlmProvider};
use crate::model::TokenUsage;
use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs},
    Client,
};
use async_trait::async_trait;

/// Provider backed by any OpenAI-compatible chat completion endpoint.
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model: String,
    id: String,
}

impl OpenAiProvider {
    pub fn new(id: &str, settings: &ProviderSettings) -> Self {
        let mut config = OpenAIConfig::new().with_api_base(&settings.base_url);
        if let Some(key) = settings.api_key() {
            config = config.with_api_key(key);
        } else {
            config = config.with_api_key("unused");
        }
        Self {
            client: Client::with_config(config),
            model: settings.model.clone(),
            id: id.to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let message = ChatCompletionRequestUserMessageArgs::default()
            .content(request.prompt)
            .build()
            .map_err(|e| LlmError::BadRequest(e.to_string()))?;

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![message.into()])
            .max_tokens(request.max_tokens)
            .temperature(request.temperature)
            .build()
            .map_err(|e| LlmError::BadRequest(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(classify)?;

        let text = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();

        let usage = response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(Completion { text, usage })
    }
}

/// Maps transport/API errors into the retry taxonomy. Anything not clearly
/// transient is treated as terminal so a broken request never burns the
/// retry budget.
fn classify(error: OpenAIError) -> LlmError {
    match error {
        OpenAIError::Reqwest(e) => {
            if e.is_timeout() || e.is_connect() || e.is_request() {
                LlmError::Network(e.to_string())
            } else {
                LlmError::BadRequest(e.to_string())
            }
        }
        OpenAIError::ApiError(api) => {
            let kind = api.r#type.clone().unwrap_or_default();
            let message = api.message.clone();
            let lowered = format!("{kind} {message}").to_lowercase();
            if lowered.contains("rate limit") || lowered.contains("rate_limit") {
                LlmError::RateLimited(message)
            } else if lowered.contains("auth")
                || lowered.contains("api key")
                || lowered.contains("permission")
            {
                LlmError::Auth(message)
            } else if lowered.contains("overloaded")
                || lowered.contains("server_error")
                || lowered.contains("timeout")
            {
                LlmError::Network(message)
            } else {
                LlmError::BadRequest(message)
            }
        }
        OpenAIError::InvalidArgument(message) => LlmError::BadRequest(message),
        other => LlmError::BadRequest(other.to_string()),
    }
}
