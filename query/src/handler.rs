use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::action::payload::{types, ActionPayload, EmbeddingResultPayload};
use common::action::{DomainAction, ServiceName};
use common::cache::{keys, JsonStore};
use common::error::{AppError, ErrorInfo};
use common::model::{ChatMessage, MessageRole, QueryConfig, RagConfig};
use common::transport::consumer::error_action_type;
use common::transport::{ActionHandler, ActionPublisher};
use vector_index::{Bm25Encoder, DocumentIndex, SearchRequest};

use crate::llm::ChatProvider;
use crate::prompt::{apply_system_prompt, build_context};

const DEFAULT_RRF_K: u32 = 60;

/// Continuation parked between the query-embedding dispatch and its
/// callback, keyed by the dispatched action id.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingQuery {
    callback_action_type: String,
    tenant_id: Uuid,
    session_id: Option<String>,
    task_id: Option<String>,
    agent_id: Option<Uuid>,
    user_id: Option<String>,
    correlation_id: Option<Uuid>,
    messages: Vec<ChatMessage>,
    user_message: String,
    query_config: QueryConfig,
    rag_config: RagConfig,
    started_at: DateTime<Utc>,
}

/// RAG retrieval and generation: query embedding via the embedding worker,
/// hybrid search, prompt assembly, provider call.
pub struct QueryHandler {
    publisher: Arc<dyn ActionPublisher>,
    index: Arc<dyn DocumentIndex>,
    llm: Arc<dyn ChatProvider>,
    pending: JsonStore,
    encoder: Bm25Encoder,
    pending_ttl_secs: u64,
}

impl QueryHandler {
    pub fn new(
        publisher: Arc<dyn ActionPublisher>,
        index: Arc<dyn DocumentIndex>,
        llm: Arc<dyn ChatProvider>,
        pending: JsonStore,
        pending_ttl_secs: u64,
    ) -> Self {
        Self {
            publisher,
            index,
            llm,
            pending,
            encoder: Bm25Encoder::default(),
            pending_ttl_secs,
        }
    }

    async fn generate(&self, action: DomainAction) -> Result<Option<DomainAction>, AppError> {
        let ActionPayload::QueryGenerate(payload) =
            ActionPayload::decode(&action.action_type, &action.data)?
        else {
            return Err(AppError::Validation("expected generate payload".into()));
        };
        let query_config = action
            .query_config
            .clone()
            .ok_or_else(|| AppError::Validation("query_config is required".into()))?;
        query_config.validate()?;
        if let Some(rag_config) = &action.rag_config {
            rag_config.validate()?;
        }

        let user_message = payload
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User && !m.content.is_empty())
            .map(|m| m.content.clone())
            .ok_or_else(|| AppError::Validation("no user message found".into()))?;

        let retrieval = action
            .rag_config
            .clone()
            .filter(|rag| !rag.retrieval_disabled());

        let Some(rag_config) = retrieval else {
            if action.rag_config.is_some() {
                debug!(
                    tenant_id = %action.tenant_id,
                    "retrieval skipped: tenant has no ingested documents"
                );
            }
            // Tool-free generation straight against the provider.
            let started = Instant::now();
            let messages = apply_system_prompt(
                &payload.messages,
                &query_config.system_prompt_template,
                None,
            );
            let (content, usage) = self.llm.generate(&messages, &query_config).await?;
            let data = json!({
                "content": content,
                "usage": usage,
                "sources": [],
                "processing_time_ms": started.elapsed().as_millis() as u64,
            });
            return Ok(action.reply(ServiceName::Query, data));
        };

        let callback_action_type = action
            .callback_action_type
            .clone()
            .ok_or_else(|| AppError::Validation("generate action requires a callback".into()))?;

        let mut embed_action = DomainAction::new(
            types::EMBEDDING_QUERY,
            ServiceName::Query,
            action.tenant_id,
            json!({ "input": user_message }),
        );
        embed_action.session_id = action.session_id.clone();
        embed_action.task_id = action.task_id.clone();
        embed_action.agent_id = action.agent_id;
        embed_action.user_id = action.user_id.clone();
        embed_action.rag_config = Some(rag_config.clone());
        let embed_action = self
            .publisher
            .publish_with_callback(embed_action, "embedding.response")
            .await?;

        let pending = PendingQuery {
            callback_action_type,
            tenant_id: action.tenant_id,
            session_id: action.session_id.clone(),
            task_id: action.task_id.clone(),
            agent_id: action.agent_id,
            user_id: action.user_id.clone(),
            correlation_id: Some(action.action_id),
            messages: payload.messages,
            user_message,
            query_config,
            rag_config,
            started_at: Utc::now(),
        };
        self.pending
            .put(
                &keys::pending_query(&embed_action.action_id),
                &pending,
                self.pending_ttl_secs,
            )
            .await?;

        info!(
            action_id = %action.action_id,
            action_type = %action.action_type,
            tenant_id = %action.tenant_id,
            session_id = action.session_id.as_deref().unwrap_or(""),
            task_id = action.task_id.as_deref().unwrap_or(""),
            "query embedding dispatched"
        );
        Ok(None)
    }

    async fn continue_with_embedding(
        &self,
        action: DomainAction,
    ) -> Result<Option<DomainAction>, AppError> {
        let Some(pending) = self.take_pending(&action).await? else {
            return Ok(None);
        };

        match self.retrieve_and_generate(&action, &pending).await {
            Ok(reply) => Ok(Some(reply)),
            Err(err) => {
                warn!(
                    tenant_id = %pending.tenant_id,
                    session_id = pending.session_id.as_deref().unwrap_or(""),
                    error = %err,
                    "retrieval generation failed"
                );
                Ok(Some(self.error_reply(&pending, &err)))
            }
        }
    }

    async fn retrieve_and_generate(
        &self,
        action: &DomainAction,
        pending: &PendingQuery,
    ) -> Result<DomainAction, AppError> {
        let ActionPayload::EmbeddingResult(result) =
            ActionPayload::decode(&action.action_type, &action.data)?
        else {
            return Err(AppError::Validation("expected embedding result".into()));
        };
        let dense = first_embedding(&result)?;

        let agent_id = pending
            .agent_id
            .ok_or_else(|| AppError::Validation("retrieval requires an agent_id".into()))?;

        let started = Instant::now();
        let sparse = self.encoder.encode(&pending.user_message);
        let request = SearchRequest {
            tenant_id: pending.tenant_id,
            agent_id,
            collection_ids: pending.rag_config.collection_ids.clone(),
            document_ids: pending.rag_config.document_ids.clone(),
            document_nature: None,
            dense,
            sparse,
            top_k: pending.rag_config.top_k,
            similarity_threshold: pending.rag_config.similarity_threshold,
            fact_density_boost: pending.rag_config.fact_density_boost,
            rrf_k: DEFAULT_RRF_K,
        };
        let hits = self.index.hybrid_search(&request).await?;
        let sources: Vec<Uuid> = hits.iter().map(|hit| hit.chunk_id).collect();

        let context = if hits.is_empty() {
            None
        } else {
            Some(build_context(&hits, pending.rag_config.top_k))
        };
        let messages = apply_system_prompt(
            &pending.messages,
            &pending.query_config.system_prompt_template,
            context.as_deref(),
        );

        let (content, usage) = self.llm.generate(&messages, &pending.query_config).await?;

        info!(
            tenant_id = %pending.tenant_id,
            session_id = pending.session_id.as_deref().unwrap_or(""),
            task_id = pending.task_id.as_deref().unwrap_or(""),
            retrieved = sources.len(),
            "generation completed"
        );

        let mut reply = DomainAction::new(
            pending.callback_action_type.clone(),
            ServiceName::Query,
            pending.tenant_id,
            json!({
                "content": content,
                "usage": usage,
                "sources": sources,
                "processing_time_ms": started.elapsed().as_millis() as u64,
            }),
        );
        reply.session_id = pending.session_id.clone();
        reply.task_id = pending.task_id.clone();
        reply.agent_id = pending.agent_id;
        reply.user_id = pending.user_id.clone();
        reply.correlation_id = pending.correlation_id;
        Ok(reply)
    }

    async fn fail_from_embedding(
        &self,
        action: DomainAction,
    ) -> Result<Option<DomainAction>, AppError> {
        let Some(pending) = self.take_pending(&action).await? else {
            return Ok(None);
        };
        let info: ErrorInfo = serde_json::from_value(action.data.clone()).unwrap_or(ErrorInfo {
            error_type: "external_service_error".into(),
            message: "query embedding failed".into(),
            details: None,
        });
        let err = AppError::UpstreamPermanent(info.message);
        Ok(Some(self.error_reply(&pending, &err)))
    }

    fn error_reply(&self, pending: &PendingQuery, err: &AppError) -> DomainAction {
        let mut reply = DomainAction::new(
            error_action_type(&pending.callback_action_type),
            ServiceName::Query,
            pending.tenant_id,
            serde_json::to_value(ErrorInfo::from_error(err)).unwrap_or(serde_json::Value::Null),
        );
        reply.session_id = pending.session_id.clone();
        reply.task_id = pending.task_id.clone();
        reply.agent_id = pending.agent_id;
        reply.user_id = pending.user_id.clone();
        reply.correlation_id = pending.correlation_id;
        reply
    }

    async fn take_pending(&self, action: &DomainAction) -> Result<Option<PendingQuery>, AppError> {
        let Some(correlation_id) = action.correlation_id else {
            warn!(action_type = %action.action_type, "embedding callback without correlation id");
            return Ok(None);
        };
        let pending: Option<PendingQuery> = self
            .pending
            .take(&keys::pending_query(&correlation_id))
            .await?;
        if pending.is_none() {
            debug!(%correlation_id, "no pending query for callback");
        }
        Ok(pending)
    }
}

fn first_embedding(result: &EmbeddingResultPayload) -> Result<Vec<f32>, AppError> {
    let row = result
        .embeddings
        .first()
        .ok_or_else(|| AppError::UpstreamPermanent("embedding result was empty".into()))?;
    if let Some(error) = &row.error {
        return Err(AppError::UpstreamPermanent(format!(
            "query embedding failed: {error}"
        )));
    }
    row.embedding
        .clone()
        .ok_or_else(|| AppError::UpstreamPermanent("embedding row without vector".into()))
}

#[async_trait]
impl ActionHandler for QueryHandler {
    fn service(&self) -> ServiceName {
        ServiceName::Query
    }

    async fn handle(&self, action: DomainAction) -> Result<Option<DomainAction>, AppError> {
        match action.action_type.as_str() {
            types::GENERATE_SIMPLE | types::GENERATE_ADVANCE => self.generate(action).await,
            types::QUERY_EMBEDDING_RESPONSE => self.continue_with_embedding(action).await,
            types::QUERY_EMBEDDING_ERROR => self.fail_from_embedding(action).await,
            other => {
                warn!(action_type = other, "unrecognized action");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::TokenUsage;
    use common::transport::RecordingPublisher;
    use std::sync::Mutex;
    use vector_index::types::sample_chunk;
    use vector_index::InMemoryIndex;

    struct StubProvider {
        reply: String,
        seen_prompts: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl StubProvider {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                seen_prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatProvider for StubProvider {
        async fn generate(
            &self,
            messages: &[ChatMessage],
            _config: &QueryConfig,
        ) -> Result<(String, TokenUsage), AppError> {
            self.seen_prompts
                .lock()
                .unwrap()
                .push(messages.to_vec());
            Ok((
                self.reply.clone(),
                TokenUsage {
                    prompt_tokens: 20,
                    completion_tokens: 10,
                    total_tokens: 30,
                },
            ))
        }
    }

    fn query_config() -> QueryConfig {
        QueryConfig {
            model: "llama-3.3-70b-versatile".into(),
            system_prompt_template: "You are a knowledgeable assistant.".into(),
            temperature: 0.3,
            max_tokens: 256,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stop: None,
            timeout_secs: None,
            max_retries: None,
        }
    }

    fn rag_config(collections: Vec<String>) -> RagConfig {
        RagConfig {
            collection_ids: collections,
            document_ids: vec![],
            top_k: 5,
            similarity_threshold: 0.0,
            embedding_model: "text-embedding-3-small".into(),
            embedding_dimensions: 1536,
            fact_density_boost: 0.0,
            max_text_length: 8192,
            max_retries: 3,
        }
    }

    fn generate_action(
        tenant: Uuid,
        agent: Uuid,
        rag: Option<RagConfig>,
    ) -> DomainAction {
        let messages = vec![ChatMessage::user("What does the handbook say about leave?")];
        let mut action = DomainAction::new(
            types::GENERATE_SIMPLE,
            ServiceName::Execution,
            tenant,
            json!({
                "messages": messages,
                "conversation_id": Uuid::new_v4(),
            }),
        )
        .with_callback("query.response")
        .with_session("sess-1")
        .with_task("task-1")
        .with_agent(agent);
        action.query_config = Some(query_config());
        action.rag_config = rag;
        action
    }

    fn fixture(
        provider: Arc<StubProvider>,
        index: Arc<InMemoryIndex>,
    ) -> (QueryHandler, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::new());
        let handler = QueryHandler::new(
            publisher.clone(),
            index,
            provider,
            JsonStore::new(None),
            600,
        );
        (handler, publisher)
    }

    #[tokio::test]
    async fn no_rag_answers_directly_with_empty_sources() {
        let provider = Arc::new(StubProvider::new("Direct answer."));
        let (handler, publisher) = fixture(provider.clone(), Arc::new(InMemoryIndex::new()));

        let action = generate_action(Uuid::new_v4(), Uuid::new_v4(), None);
        let reply = handler.handle(action).await.unwrap().expect("direct reply");

        assert_eq!(reply.action_type, "execution.query.response");
        assert_eq!(reply.data["content"], "Direct answer.");
        assert_eq!(reply.data["sources"], json!([]));
        assert!(publisher.published().is_empty(), "no embedding dispatch");
    }

    #[tokio::test]
    async fn sentinel_collections_skip_retrieval() {
        let provider = Arc::new(StubProvider::new("No documents answer."));
        let (handler, publisher) = fixture(provider.clone(), Arc::new(InMemoryIndex::new()));

        let action = generate_action(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Some(rag_config(vec!["no_documents_available".into()])),
        );
        let reply = handler.handle(action).await.unwrap().expect("direct reply");
        assert_eq!(reply.data["sources"], json!([]));
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn rag_flow_dispatches_embedding_then_searches_and_cites() {
        let index = Arc::new(InMemoryIndex::new());
        let tenant = Uuid::new_v4();
        let agent = Uuid::new_v4();
        let mut chunk = sample_chunk(tenant, "col_a");
        chunk.agent_ids = vec![agent];
        chunk.content = "Employees accrue 25 days of leave per year.".into();
        chunk.content_raw = "Employees accrue 25 days of leave per year.".into();
        chunk.embedding = Some(vec![1.0, 0.0, 0.0]);
        index.upsert_chunks(&[chunk.clone()]).await.unwrap();

        let provider = Arc::new(StubProvider::new("You accrue 25 days."));
        let (handler, publisher) = fixture(provider.clone(), index);

        let action = generate_action(tenant, agent, Some(rag_config(vec!["col_a".into()])));
        let out = handler.handle(action).await.unwrap();
        assert!(out.is_none(), "waits for the embedding callback");

        let dispatched = publisher.published().remove(0);
        assert_eq!(dispatched.action_type, types::EMBEDDING_QUERY);
        assert_eq!(
            dispatched.callback_action_type.as_deref(),
            Some("query.embedding.response")
        );

        let mut callback = DomainAction::new(
            types::QUERY_EMBEDDING_RESPONSE,
            ServiceName::Embedding,
            tenant,
            json!({
                "embeddings": [{"chunk_id": Uuid::new_v4(), "embedding": [1.0, 0.0, 0.0]}],
                "model": "text-embedding-3-small",
                "dimensions": 3,
                "usage": TokenUsage::default(),
                "processing_time_ms": 5,
            }),
        );
        callback.correlation_id = Some(dispatched.action_id);

        let reply = handler
            .handle(callback)
            .await
            .unwrap()
            .expect("reply after retrieval");
        assert_eq!(reply.action_type, "execution.query.response");
        let sources = reply.data["sources"].as_array().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0], json!(chunk.chunk_id));

        // The provider saw the knowledge block as the sole system message.
        let prompts = provider.seen_prompts.lock().unwrap();
        let system = &prompts[0][0];
        assert_eq!(system.role, MessageRole::System);
        assert!(system.content.contains("Knowledge Chunks:"));
        assert!(system.content.contains("25 days of leave"));
    }

    #[tokio::test]
    async fn embedding_error_produces_query_error_reply() {
        let provider = Arc::new(StubProvider::new("unused"));
        let (handler, publisher) = fixture(provider, Arc::new(InMemoryIndex::new()));
        let tenant = Uuid::new_v4();

        let action = generate_action(tenant, Uuid::new_v4(), Some(rag_config(vec!["col_a".into()])));
        handler.handle(action).await.unwrap();
        let dispatched = publisher.published().remove(0);

        let mut error = DomainAction::new(
            types::QUERY_EMBEDDING_ERROR,
            ServiceName::Embedding,
            tenant,
            json!({"error_type": "external_service_error", "message": "rate limited"}),
        );
        error.correlation_id = Some(dispatched.action_id);

        let reply = handler.handle(error).await.unwrap().expect("error reply");
        assert_eq!(reply.action_type, "execution.query.error");
    }

    #[tokio::test]
    async fn missing_user_message_is_validation_error() {
        let provider = Arc::new(StubProvider::new("unused"));
        let (handler, _publisher) = fixture(provider, Arc::new(InMemoryIndex::new()));
        let mut action = generate_action(Uuid::new_v4(), Uuid::new_v4(), None);
        action.data = json!({
            "messages": [ChatMessage::assistant("only an assistant turn")],
            "conversation_id": Uuid::new_v4(),
        });
        assert!(matches!(
            handler.handle(action).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn invalid_temperature_is_rejected_before_any_dispatch() {
        let provider = Arc::new(StubProvider::new("unused"));
        let (handler, publisher) = fixture(provider, Arc::new(InMemoryIndex::new()));
        let mut action = generate_action(Uuid::new_v4(), Uuid::new_v4(), None);
        if let Some(config) = action.query_config.as_mut() {
            config.temperature = 7.0;
        }
        assert!(handler.handle(action).await.is_err());
        assert!(publisher.published().is_empty());
    }
}
