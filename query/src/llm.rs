use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, Stop,
};
use async_trait::async_trait;
use tracing::{debug, warn};

use common::error::{classify_openai_error, AppError, ProviderErrorKind};
use common::model::{ChatMessage, MessageRole, QueryConfig, TokenUsage};

/// Seam over the chat completion provider.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        config: &QueryConfig,
    ) -> Result<(String, TokenUsage), AppError>;
}

/// OpenAI-compatible chat endpoint (the inference provider speaks the same
/// wire format). Per-call timeout and retry budget come from the query
/// config, bounded by the service defaults.
pub struct OpenAiChatProvider {
    client: async_openai::Client<OpenAIConfig>,
    default_timeout: Duration,
    default_max_retries: usize,
}

impl OpenAiChatProvider {
    pub fn new(api_key: &str, base_url: &str, default_timeout: Duration) -> Self {
        let client = async_openai::Client::with_config(
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(base_url),
        );
        Self {
            client,
            default_timeout,
            default_max_retries: 2,
        }
    }

    fn effective_timeout(&self, config: &QueryConfig) -> Duration {
        config
            .timeout_secs
            .map(Duration::from_secs)
            .map_or(self.default_timeout, |t| t.min(self.default_timeout))
    }
}

fn to_request_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage, AppError> {
    let converted = match message.role {
        MessageRole::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(message.content.clone())
            .build()
            .map_err(AppError::from)?
            .into(),
        MessageRole::User => ChatCompletionRequestUserMessageArgs::default()
            .content(message.content.clone())
            .build()
            .map_err(AppError::from)?
            .into(),
        MessageRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(message.content.clone())
            .build()
            .map_err(AppError::from)?
            .into(),
    };
    Ok(converted)
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        config: &QueryConfig,
    ) -> Result<(String, TokenUsage), AppError> {
        let request_messages = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&config.model)
            .messages(request_messages)
            .temperature(config.temperature)
            .max_tokens(config.max_tokens)
            .top_p(config.top_p)
            .frequency_penalty(config.frequency_penalty)
            .presence_penalty(config.presence_penalty);
        if let Some(stop) = &config.stop {
            builder.stop(Stop::StringArray(stop.clone()));
        }
        let request = builder.build()?;

        let timeout = self.effective_timeout(config);
        let max_retries = config.max_retries.unwrap_or(self.default_max_retries);

        let mut attempt = 0;
        loop {
            let chat = self.client.chat();
            let call = chat.create(request.clone());
            let outcome = tokio::time::timeout(timeout, call).await;
            let err = match outcome {
                Ok(Ok(response)) => {
                    let content = response
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
                    return Ok((content, usage));
                }
                Ok(Err(err)) => match classify_openai_error(&err) {
                    ProviderErrorKind::Transient => AppError::UpstreamTransient(err.to_string()),
                    ProviderErrorKind::Permanent => {
                        return Err(AppError::UpstreamPermanent(err.to_string()))
                    }
                    ProviderErrorKind::Other => return Err(err.into()),
                },
                Err(_) => AppError::UpstreamTransient(format!(
                    "chat completion timed out after {}s",
                    timeout.as_secs()
                )),
            };

            if attempt >= max_retries {
                warn!(attempt, error = %err, "chat completion retries exhausted");
                return Err(err);
            }
            let backoff = Duration::from_millis(200 * 2u64.pow(attempt as u32));
            debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %err, "retrying chat completion");
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}
