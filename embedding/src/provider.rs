use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::CreateEmbeddingRequestArgs;
use async_trait::async_trait;
use tracing::{debug, warn};

use common::error::{classify_openai_error, AppError, ProviderErrorKind};
use common::model::TokenUsage;

/// Seam over the embedding provider.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(
        &self,
        texts: &[String],
        model: &str,
        dimensions: u32,
        user: &str,
        max_retries: usize,
    ) -> Result<(Vec<Vec<f32>>, TokenUsage), AppError>;
}

pub struct OpenAiEmbedder {
    client: async_openai::Client<OpenAIConfig>,
}

impl OpenAiEmbedder {
    pub fn new(api_key: &str, base_url: &str) -> Self {
        Self {
            client: async_openai::Client::with_config(
                OpenAIConfig::new()
                    .with_api_key(api_key)
                    .with_api_base(base_url),
            ),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(
        &self,
        texts: &[String],
        model: &str,
        dimensions: u32,
        user: &str,
        max_retries: usize,
    ) -> Result<(Vec<Vec<f32>>, TokenUsage), AppError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(model)
            .input(texts.to_vec())
            .dimensions(dimensions)
            .user(user)
            .build()?;

        let mut attempt = 0;
        loop {
            match self.client.embeddings().create(request.clone()).await {
                Ok(response) => {
                    let mut embeddings: Vec<(u32, Vec<f32>)> = response
                        .data
                        .into_iter()
                        .map(|row| (row.index, row.embedding))
                        .collect();
                    embeddings.sort_by_key(|(index, _)| *index);
                    let usage = TokenUsage {
                        prompt_tokens: response.usage.prompt_tokens,
                        completion_tokens: 0,
                        total_tokens: response.usage.total_tokens,
                    };
                    return Ok((
                        embeddings.into_iter().map(|(_, e)| e).collect(),
                        usage,
                    ));
                }
                Err(err) => {
                    let transient =
                        classify_openai_error(&err) == ProviderErrorKind::Transient;
                    if !transient || attempt >= max_retries {
                        if transient {
                            warn!(attempt, error = %err, "embedding retries exhausted");
                        }
                        return Err(err.into());
                    }
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt as u32));
                    debug!(attempt, error = %err, "retrying embedding call");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
