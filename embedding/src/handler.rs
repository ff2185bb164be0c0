use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use common::action::payload::{ActionPayload, EmbeddingRow};
use common::action::{DomainAction, ServiceName};
use common::error::AppError;
use common::transport::ActionHandler;

use crate::provider::Embedder;

const DEFAULT_MAX_TEXT_LENGTH: usize = 8192;
const DEFAULT_MAX_RETRIES: usize = 3;

/// Batch and single-query embedding against the provider. Individual texts
/// may fail validation; the batch succeeds if anything embedded.
pub struct EmbeddingHandler {
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingHandler {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    async fn run_batch(
        &self,
        action: &DomainAction,
        texts: Vec<String>,
        chunk_ids: Vec<Uuid>,
        model: String,
        dimensions: u32,
    ) -> Result<serde_json::Value, AppError> {
        if texts.len() != chunk_ids.len() {
            return Err(AppError::Validation(format!(
                "texts ({}) and chunk_ids ({}) must align",
                texts.len(),
                chunk_ids.len()
            )));
        }

        let (max_text_length, max_retries) = action
            .rag_config
            .as_ref()
            .map(|rag| (rag.max_text_length, rag.max_retries))
            .unwrap_or((DEFAULT_MAX_TEXT_LENGTH, DEFAULT_MAX_RETRIES));

        let started = Instant::now();
        let mut rows: Vec<Option<EmbeddingRow>> = vec![None; chunk_ids.len()];
        let mut valid: Vec<(usize, &String)> = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                rows[i] = Some(EmbeddingRow {
                    chunk_id: chunk_ids[i],
                    embedding: None,
                    error: Some("text is empty".to_string()),
                });
            } else if text.chars().count() > max_text_length {
                rows[i] = Some(EmbeddingRow {
                    chunk_id: chunk_ids[i],
                    embedding: None,
                    error: Some(format!(
                        "text exceeds the {max_text_length}-character limit"
                    )),
                });
            } else {
                valid.push((i, text));
            }
        }

        let mut usage = common::model::TokenUsage::default();
        if !valid.is_empty() {
            let inputs: Vec<String> = valid.iter().map(|(_, t)| (*t).clone()).collect();
            // The provider-side user tag is the tenant, for per-tenant
            // attribution upstream.
            let user = action.tenant_id.to_string();
            let (embeddings, call_usage) = self
                .embedder
                .embed(&inputs, &model, dimensions, &user, max_retries)
                .await?;
            if embeddings.len() != valid.len() {
                return Err(AppError::UpstreamPermanent(format!(
                    "provider returned {} embeddings for {} inputs",
                    embeddings.len(),
                    valid.len()
                )));
            }
            usage = call_usage;
            for ((i, _), embedding) in valid.into_iter().zip(embeddings) {
                rows[i] = Some(EmbeddingRow {
                    chunk_id: chunk_ids[i],
                    embedding: Some(embedding),
                    error: None,
                });
            }
        }

        let embeddings: Vec<EmbeddingRow> = rows.into_iter().flatten().collect();
        let failed = embeddings.iter().filter(|r| r.error.is_some()).count();
        info!(
            action_id = %action.action_id,
            tenant_id = %action.tenant_id,
            task_id = action.task_id.as_deref().unwrap_or(""),
            requested = embeddings.len(),
            failed,
            "embedding batch finished"
        );

        Ok(json!({
            "embeddings": embeddings,
            "model": model,
            "dimensions": dimensions,
            "usage": usage,
            "processing_time_ms": started.elapsed().as_millis() as u64,
        }))
    }
}

#[async_trait]
impl ActionHandler for EmbeddingHandler {
    fn service(&self) -> ServiceName {
        ServiceName::Embedding
    }

    async fn handle(&self, action: DomainAction) -> Result<Option<DomainAction>, AppError> {
        match ActionPayload::decode(&action.action_type, &action.data)? {
            ActionPayload::EmbeddingBatch(payload) => {
                let data = self
                    .run_batch(
                        &action,
                        payload.texts,
                        payload.chunk_ids,
                        payload.model,
                        payload.dimensions,
                    )
                    .await?;
                Ok(action.reply(ServiceName::Embedding, data))
            }
            ActionPayload::EmbeddingQuery(payload) => {
                let rag = action.rag_config.clone().ok_or_else(|| {
                    AppError::Validation("query embedding requires rag_config".into())
                })?;
                let data = self
                    .run_batch(
                        &action,
                        vec![payload.input],
                        vec![Uuid::new_v4()],
                        rag.embedding_model,
                        rag.embedding_dimensions,
                    )
                    .await?;
                Ok(action.reply(ServiceName::Embedding, data))
            }
            _ => {
                warn!(action_type = %action.action_type, "unrecognized action");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::action::payload::{types, EmbeddingResultPayload};
    use common::model::{RagConfig, TokenUsage};
    use std::sync::Mutex;

    struct StubEmbedder {
        dimensions: usize,
        calls: Mutex<Vec<(Vec<String>, String)>>,
        fail_with: Option<AppError>,
    }

    impl StubEmbedder {
        fn new(dimensions: usize) -> Self {
            Self {
                dimensions,
                calls: Mutex::new(Vec::new()),
                fail_with: None,
            }
        }
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(
            &self,
            texts: &[String],
            _model: &str,
            _dimensions: u32,
            user: &str,
            _max_retries: usize,
        ) -> Result<(Vec<Vec<f32>>, TokenUsage), AppError> {
            if let Some(err) = &self.fail_with {
                return Err(AppError::UpstreamPermanent(err.to_string()));
            }
            self.calls
                .lock()
                .unwrap()
                .push((texts.to_vec(), user.to_string()));
            let embeddings = texts
                .iter()
                .map(|_| vec![0.1; self.dimensions])
                .collect();
            Ok((
                embeddings,
                TokenUsage {
                    prompt_tokens: texts.len() as u32 * 4,
                    completion_tokens: 0,
                    total_tokens: texts.len() as u32 * 4,
                },
            ))
        }
    }

    fn batch_action(tenant: Uuid, texts: Vec<&str>, chunk_ids: Vec<Uuid>) -> DomainAction {
        DomainAction::new(
            types::EMBEDDING_BATCH,
            ServiceName::Ingestion,
            tenant,
            json!({
                "texts": texts,
                "chunk_ids": chunk_ids,
                "model": "text-embedding-3-small",
                "dimensions": 1536,
            }),
        )
        .with_callback("embedding.response")
        .with_task("task-1")
    }

    #[tokio::test]
    async fn batch_maps_embeddings_back_by_chunk_id() {
        let handler = EmbeddingHandler::new(Arc::new(StubEmbedder::new(4)));
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let action = batch_action(Uuid::new_v4(), vec!["alpha", "beta"], ids.clone());

        let reply = handler.handle(action).await.unwrap().expect("reply owed");
        assert_eq!(reply.action_type, "ingestion.embedding.response");
        let payload: EmbeddingResultPayload = serde_json::from_value(reply.data).unwrap();
        assert_eq!(payload.embeddings.len(), 2);
        assert_eq!(payload.embeddings[0].chunk_id, ids[0]);
        assert_eq!(payload.embeddings[1].chunk_id, ids[1]);
        assert!(payload.any_succeeded());
        assert!(payload.usage.total_tokens > 0);
    }

    #[tokio::test]
    async fn invalid_texts_become_per_chunk_errors() {
        let embedder = Arc::new(StubEmbedder::new(4));
        let handler = EmbeddingHandler::new(embedder.clone());
        let ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let long = "x".repeat(10_000);
        let mut action = batch_action(
            Uuid::new_v4(),
            vec!["", long.as_str(), "fine"],
            ids.clone(),
        );
        action.rag_config = Some(RagConfig {
            collection_ids: vec!["col".into()],
            document_ids: vec![],
            top_k: 5,
            similarity_threshold: 0.0,
            embedding_model: "text-embedding-3-small".into(),
            embedding_dimensions: 1536,
            fact_density_boost: 0.0,
            max_text_length: 8192,
            max_retries: 3,
        });

        let reply = handler.handle(action).await.unwrap().unwrap();
        let payload: EmbeddingResultPayload = serde_json::from_value(reply.data).unwrap();
        assert!(payload.embeddings[0].error.as_deref().unwrap().contains("empty"));
        assert!(payload.embeddings[1].error.as_deref().unwrap().contains("limit"));
        assert!(payload.embeddings[2].embedding.is_some());
        assert!(payload.any_succeeded());

        // Only the valid text reached the provider.
        let calls = embedder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, vec!["fine".to_string()]);
    }

    #[tokio::test]
    async fn provider_user_is_the_stringified_tenant() {
        let embedder = Arc::new(StubEmbedder::new(4));
        let handler = EmbeddingHandler::new(embedder.clone());
        let tenant = Uuid::new_v4();
        let action = batch_action(tenant, vec!["alpha"], vec![Uuid::new_v4()]);
        handler.handle(action).await.unwrap();
        assert_eq!(embedder.calls.lock().unwrap()[0].1, tenant.to_string());
    }

    #[tokio::test]
    async fn mismatched_lengths_are_rejected() {
        let handler = EmbeddingHandler::new(Arc::new(StubEmbedder::new(4)));
        let action = batch_action(Uuid::new_v4(), vec!["alpha", "beta"], vec![Uuid::new_v4()]);
        assert!(matches!(
            handler.handle(action).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn query_embedding_returns_single_row() {
        let handler = EmbeddingHandler::new(Arc::new(StubEmbedder::new(4)));
        let mut action = DomainAction::new(
            types::EMBEDDING_QUERY,
            ServiceName::Query,
            Uuid::new_v4(),
            json!({"input": "what is the leave policy"}),
        )
        .with_callback("embedding.response");
        action.rag_config = Some(RagConfig {
            collection_ids: vec!["col".into()],
            document_ids: vec![],
            top_k: 5,
            similarity_threshold: 0.0,
            embedding_model: "text-embedding-3-small".into(),
            embedding_dimensions: 1536,
            fact_density_boost: 0.0,
            max_text_length: 8192,
            max_retries: 3,
        });

        let reply = handler.handle(action).await.unwrap().unwrap();
        assert_eq!(reply.action_type, "query.embedding.response");
        let payload: EmbeddingResultPayload = serde_json::from_value(reply.data).unwrap();
        assert_eq!(payload.embeddings.len(), 1);
        assert!(payload.embeddings[0].embedding.is_some());
    }
}
