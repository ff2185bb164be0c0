use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::action::payload::{
    types, ActionPayload, DocumentIngestPayload, LanguageModelSize, StageStatus,
};
use common::action::{DomainAction, ServiceName};
use common::error::{AppError, ErrorInfo};
use common::metadata::{DocumentRecord, MetadataStore};
use common::transport::{ActionHandler, ActionPublisher};
use common::ws::{ConnectionRegistry, ServerFrame};
use vector_index::DocumentIndex;

use crate::chunker::{chunk_document, ChunkerInput};
use crate::task::{IngestionStatus, IngestionTask, TaskStore};

const EXTRACTION_ERROR: &str = "ingestion.extraction.error";
const EMBEDDING_ERROR: &str = "ingestion.embedding.error";

/// What the caller gets back immediately; progress continues over the task
/// WebSocket.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IngestionReceipt {
    pub task_id: String,
    pub document_id: Uuid,
    pub collection_id: String,
    pub agent_ids: Vec<Uuid>,
    pub status: String,
}

/// Pipeline controller: owns the per-task state machine and drives the
/// extract -> chunk -> embed -> store stages from inbound actions.
pub struct IngestionPipeline {
    publisher: Arc<dyn ActionPublisher>,
    tasks: TaskStore,
    index: Arc<dyn DocumentIndex>,
    store: Arc<dyn MetadataStore>,
    ws: Arc<ConnectionRegistry>,
    language_model_size: LanguageModelSize,
}

impl IngestionPipeline {
    pub fn new(
        publisher: Arc<dyn ActionPublisher>,
        tasks: TaskStore,
        index: Arc<dyn DocumentIndex>,
        store: Arc<dyn MetadataStore>,
        ws: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            publisher,
            tasks,
            index,
            store,
            ws,
            language_model_size: LanguageModelSize::Medium,
        }
    }

    pub fn task_store(&self) -> &TaskStore {
        &self.tasks
    }

    /// E1: validate, enforce collection consistency, persist initial state
    /// and hand the file to extraction. Returns before any heavy work.
    pub async fn begin_ingestion(
        &self,
        tenant_id: Uuid,
        request: DocumentIngestPayload,
        user_id: Option<String>,
    ) -> Result<IngestionReceipt, AppError> {
        validate_request(&request)?;

        if !self.store.check_resource_limit(tenant_id, "documents").await? {
            return Err(AppError::Validation(
                "document limit reached for this workspace".into(),
            ));
        }

        if let Some(collection_id) = &request.collection_id {
            self.check_collection_consistency(tenant_id, collection_id, &request)
                .await?;
        }
        let collection_id = request
            .collection_id
            .clone()
            .unwrap_or_else(|| format!("col_{}", Uuid::new_v4().simple()));

        let document_id = Uuid::new_v4();
        let mut task = IngestionTask::new(
            document_id,
            tenant_id,
            collection_id.clone(),
            request.agent_ids.clone(),
            request.document_name.clone(),
            request.document_type,
            request.embedding_model.clone(),
            request.embedding_dimensions,
            request.chunk_size,
            request.chunk_overlap,
            request.file_path.clone(),
            user_id.clone(),
        );
        self.tasks.save(&task).await?;

        let mut extract = DomainAction::new(
            types::EXTRACTION_PROCESS,
            ServiceName::Ingestion,
            tenant_id,
            json!({
                "file_path": request.file_path,
                "document_name": request.document_name,
                "document_type": request.document_type,
                "language_model_size": self.language_model_size,
            }),
        )
        .with_task(&task.task_id);
        extract.user_id = user_id;
        self.publisher
            .publish_with_callback(extract, "extraction.response")
            .await?;

        task.transition(IngestionStatus::Extracting, "extracting document")?;
        self.persist_and_notify(&task).await?;

        info!(
            task_id = %task.task_id,
            tenant_id = %tenant_id,
            document_id = %document_id,
            collection_id = %collection_id,
            "ingestion started"
        );
        Ok(IngestionReceipt {
            task_id: task.task_id,
            document_id,
            collection_id,
            agent_ids: request.agent_ids,
            status: "processing".to_string(),
        })
    }

    /// All documents sharing a collection must agree on embedding model and
    /// dimensions; violations are rejected before any work is done.
    async fn check_collection_consistency(
        &self,
        tenant_id: Uuid,
        collection_id: &str,
        request: &DocumentIngestPayload,
    ) -> Result<(), AppError> {
        let existing = self
            .store
            .documents_in_collection(tenant_id, collection_id)
            .await?;
        for document in existing {
            if document.embedding_model != request.embedding_model
                || document.embedding_dimensions != request.embedding_dimensions
            {
                return Err(AppError::Integrity(format!(
                    "collection {collection_id} expects {} ({} dims), got {} ({} dims)",
                    document.embedding_model,
                    document.embedding_dimensions,
                    request.embedding_model,
                    request.embedding_dimensions
                )));
            }
        }
        Ok(())
    }

    /// E2: extraction finished; chunk and hand off to embedding.
    async fn on_extraction(&self, action: DomainAction) -> Result<(), AppError> {
        let Some(mut task) = self.load_task(&action).await? else {
            return Ok(());
        };

        let ActionPayload::ExtractionResult(payload) =
            ActionPayload::decode(&action.action_type, &action.data)?
        else {
            return Err(AppError::Validation("expected extraction result".into()));
        };

        if payload.status == StageStatus::Failed {
            let message = payload
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "extraction failed".to_string());
            return self.fail_task(&mut task, message).await;
        }
        let Some(outcome) = payload.outcome else {
            return self
                .fail_task(&mut task, "extraction completed without output".to_string())
                .await;
        };

        task.transition(IngestionStatus::Chunking, "chunking document")?;
        self.persist_and_notify(&task).await?;

        let chunked = chunk_document(&ChunkerInput {
            text: &outcome.extracted_text,
            sections: &outcome.structure.sections,
            enrichment: &outcome.enrichment,
            document_id: task.document_id,
            tenant_id: task.tenant_id,
            collection_id: &task.collection_id,
            agent_ids: &task.agent_ids,
            document_name: &task.document_name,
            document_type: task.document_type,
            page_count: outcome.structure.page_count,
            chunk_size: task.chunk_size,
            chunk_overlap: task.chunk_overlap,
        });
        let chunks = match chunked {
            Ok(chunks) => chunks,
            Err(err) => return self.fail_task(&mut task, err.to_string()).await,
        };
        if chunks.is_empty() {
            return self
                .fail_task(&mut task, "document produced no chunks".to_string())
                .await;
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let chunk_ids: Vec<Uuid> = chunks.iter().map(|c| c.chunk_id).collect();
        task.total_chunks = chunks.len();
        task.chunks = Some(chunks);
        task.transition(IngestionStatus::Embedding, "generating embeddings")?;
        self.persist_and_notify(&task).await?;

        let mut embed = DomainAction::new(
            types::EMBEDDING_BATCH,
            ServiceName::Ingestion,
            task.tenant_id,
            json!({
                "texts": texts,
                "chunk_ids": chunk_ids,
                "model": task.embedding_model,
                "dimensions": task.embedding_dimensions,
            }),
        )
        .with_task(&task.task_id);
        embed.user_id = task.user_id.clone();
        self.publisher
            .publish_with_callback(embed, "embedding.response")
            .await?;

        info!(
            task_id = %task.task_id,
            total_chunks = task.total_chunks,
            extraction_method = %outcome.extraction_method,
            "chunks dispatched for embedding"
        );
        Ok(())
    }

    /// E3: embeddings arrived; upsert vectors and persist metadata.
    async fn on_embedding(&self, action: DomainAction) -> Result<(), AppError> {
        let Some(mut task) = self.load_task(&action).await? else {
            return Ok(());
        };
        if task.status.is_terminal() {
            // Duplicate delivery after completion; upsert idempotence and
            // the swallowed metadata conflict make the replay harmless.
            debug!(task_id = %task.task_id, "ignoring callback for settled task");
            return Ok(());
        }

        let ActionPayload::EmbeddingResult(payload) =
            ActionPayload::decode(&action.action_type, &action.data)?
        else {
            return Err(AppError::Validation("expected embedding result".into()));
        };

        let Some(mut chunks) = task.chunks.take() else {
            return self
                .fail_task(&mut task, "no in-flight chunks for embedding callback".into())
                .await;
        };

        if !payload.any_succeeded() {
            return self
                .fail_task(&mut task, "embedding batch failed entirely".to_string())
                .await;
        }

        // Embeddings map back to chunks by position; rows that failed stay
        // without a vector and are dropped below.
        for (chunk, row) in chunks.iter_mut().zip(payload.embeddings.iter()) {
            if let Some(embedding) = &row.embedding {
                chunk.embedding = Some(embedding.clone());
            } else {
                task.failed_ids.push(row.chunk_id);
            }
        }
        chunks.retain(|c| c.embedding.is_some());

        task.transition(IngestionStatus::Storing, "storing vectors")?;
        self.persist_and_notify(&task).await?;

        let outcome = match self.index.upsert_chunks(&chunks).await {
            Ok(outcome) => outcome,
            Err(err) => return self.fail_task(&mut task, err.to_string()).await,
        };
        task.failed_ids.extend(outcome.failed_ids.iter().copied());
        if outcome.stored == 0 {
            return self
                .fail_task(&mut task, "vector upsert stored nothing".to_string())
                .await;
        }
        task.processed_chunks = outcome.stored;

        let record = DocumentRecord {
            document_id: task.document_id,
            tenant_id: task.tenant_id,
            collection_id: task.collection_id.clone(),
            document_name: task.document_name.clone(),
            document_type: task.document_type.as_str().to_string(),
            embedding_model: task.embedding_model.clone(),
            embedding_dimensions: task.embedding_dimensions,
            chunk_size: task.chunk_size,
            chunk_overlap: task.chunk_overlap,
            status: "completed".to_string(),
            total_chunks: task.total_chunks,
            processed_chunks: task.processed_chunks,
            agent_ids: task.agent_ids.clone(),
            metadata: None,
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.insert_document(&record).await {
            return self.fail_task(&mut task, err.to_string()).await;
        }

        task.transition(IngestionStatus::Completed, "ingestion completed")?;
        task.chunks = None;
        self.persist_and_notify(&task).await?;

        info!(
            task_id = %task.task_id,
            tenant_id = %task.tenant_id,
            document_id = %task.document_id,
            stored = outcome.stored,
            failed = task.failed_ids.len(),
            "ingestion completed"
        );
        Ok(())
    }

    /// Deletes a document everywhere: vectors by filter, metadata through
    /// the privileged client.
    pub async fn delete_document(
        &self,
        tenant_id: Uuid,
        collection_id: &str,
        document_id: Uuid,
    ) -> Result<(), AppError> {
        self.index
            .delete_document(tenant_id, collection_id, document_id)
            .await?;
        self.store
            .delete_document(tenant_id, collection_id, document_id)
            .await?;
        info!(%tenant_id, %document_id, collection_id, "document deleted");
        Ok(())
    }

    async fn stage_error(&self, action: DomainAction) -> Result<(), AppError> {
        let Some(mut task) = self.load_task(&action).await? else {
            return Ok(());
        };
        let info: ErrorInfo = serde_json::from_value(action.data.clone()).unwrap_or(ErrorInfo {
            error_type: "internal_error".into(),
            message: "pipeline stage failed".into(),
            details: None,
        });
        self.fail_task(&mut task, info.message).await
    }

    async fn fail_task(&self, task: &mut IngestionTask, error: String) -> Result<(), AppError> {
        warn!(task_id = %task.task_id, error = %error, "ingestion task failed");
        task.fail(error);
        self.persist_and_notify(task).await
    }

    async fn load_task(&self, action: &DomainAction) -> Result<Option<IngestionTask>, AppError> {
        let Some(task_id) = &action.task_id else {
            warn!(action_type = %action.action_type, "callback without task_id");
            return Ok(None);
        };
        let task = self.tasks.load(task_id).await?;
        if task.is_none() {
            warn!(%task_id, "no cached state for task (expired or foreign)");
        }
        Ok(task)
    }

    async fn persist_and_notify(&self, task: &IngestionTask) -> Result<(), AppError> {
        self.tasks.save(task).await?;
        self.ws
            .send(
                &task.task_id,
                ServerFrame::IngestionProgress(task.progress_frame()),
            )
            .await;
        Ok(())
    }
}

#[async_trait]
impl ActionHandler for IngestionPipeline {
    fn service(&self) -> ServiceName {
        ServiceName::Ingestion
    }

    async fn handle(&self, action: DomainAction) -> Result<Option<DomainAction>, AppError> {
        match action.action_type.as_str() {
            types::DOCUMENT_INGEST => {
                let ActionPayload::DocumentIngest(request) =
                    ActionPayload::decode(&action.action_type, &action.data)?
                else {
                    return Err(AppError::Validation("expected ingest payload".into()));
                };
                self.begin_ingestion(action.tenant_id, request, action.user_id.clone())
                    .await?;
                Ok(None)
            }
            types::EXTRACTION_RESPONSE => {
                self.on_extraction(action).await?;
                Ok(None)
            }
            types::EMBEDDING_RESPONSE => {
                self.on_embedding(action).await?;
                Ok(None)
            }
            EXTRACTION_ERROR | EMBEDDING_ERROR => {
                self.stage_error(action).await?;
                Ok(None)
            }
            other => {
                warn!(action_type = other, "unrecognized action");
                Ok(None)
            }
        }
    }
}

fn validate_request(request: &DocumentIngestPayload) -> Result<(), AppError> {
    if request.document_name.is_empty() {
        return Err(AppError::Validation("document_name is required".into()));
    }
    if request.embedding_model.is_empty() {
        return Err(AppError::Validation("embedding_model is required".into()));
    }
    if request.embedding_dimensions == 0 {
        return Err(AppError::Validation(
            "embedding_dimensions must be positive".into(),
        ));
    }
    if request.chunk_size == 0 {
        return Err(AppError::Validation("chunk_size must be positive".into()));
    }
    if request.chunk_overlap >= request.chunk_size {
        return Err(AppError::Validation(
            "chunk_overlap must be smaller than chunk_size".into(),
        ));
    }
    if request.agent_ids.is_empty() {
        return Err(AppError::Validation(
            "at least one agent_id is required".into(),
        ));
    }
    if request.file_path.is_empty() {
        return Err(AppError::Validation("file_path is required".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::cache::JsonStore;
    use common::metadata::InMemoryMetadataStore;
    use common::model::{DocumentStructure, DocumentType, NlpEnrichment};
    use common::transport::RecordingPublisher;
    use vector_index::InMemoryIndex;

    struct Fixture {
        pipeline: IngestionPipeline,
        publisher: Arc<RecordingPublisher>,
        index: Arc<InMemoryIndex>,
        store: Arc<InMemoryMetadataStore>,
    }

    fn fixture() -> Fixture {
        let publisher = Arc::new(RecordingPublisher::new());
        let index = Arc::new(InMemoryIndex::new());
        let store = Arc::new(InMemoryMetadataStore::new());
        let pipeline = IngestionPipeline::new(
            publisher.clone(),
            TaskStore::new(JsonStore::new(None), 3600),
            index.clone(),
            store.clone(),
            Arc::new(ConnectionRegistry::new()),
        );
        Fixture {
            pipeline,
            publisher,
            index,
            store,
        }
    }

    fn ingest_request(collection_id: Option<&str>) -> DocumentIngestPayload {
        DocumentIngestPayload {
            document_name: "handbook.md".into(),
            document_type: DocumentType::Markdown,
            collection_id: collection_id.map(str::to_string),
            embedding_model: "text-embedding-3-small".into(),
            embedding_dimensions: 1536,
            // Narrow chunks so the fixture document splits several times.
            chunk_size: 64,
            chunk_overlap: 8,
            agent_ids: vec![Uuid::new_v4(), Uuid::new_v4()],
            file_path: "/tmp/handbook.md".into(),
            metadata: None,
        }
    }

    fn extraction_callback(task_id: &str, tenant_id: Uuid) -> DomainAction {
        let outcome = serde_json::json!({
            "status": "completed",
            "outcome": {
                "extracted_text": "# Handbook\n\nThe complete employee handbook covering leave policy, benefits, equipment and the remote work rules in enough detail to split into several chunks of meaningful content.",
                "structure": DocumentStructure::default(),
                "enrichment": NlpEnrichment { language: "en".into(), ..Default::default() },
                "extraction_method": "markdown",
                "language": "en",
            },
        });
        DomainAction::new(
            types::EXTRACTION_RESPONSE,
            ServiceName::Extraction,
            tenant_id,
            outcome,
        )
        .with_task(task_id)
    }

    fn embedding_callback(task_id: &str, tenant_id: Uuid, chunk_ids: &[Uuid]) -> DomainAction {
        let rows: Vec<serde_json::Value> = chunk_ids
            .iter()
            .map(|id| serde_json::json!({"chunk_id": id, "embedding": [0.5, 0.5, 0.5]}))
            .collect();
        DomainAction::new(
            types::EMBEDDING_RESPONSE,
            ServiceName::Embedding,
            tenant_id,
            serde_json::json!({
                "embeddings": rows,
                "model": "text-embedding-3-small",
                "dimensions": 3,
                "usage": {"prompt_tokens": 10, "completion_tokens": 0, "total_tokens": 10},
                "processing_time_ms": 8,
            }),
        )
        .with_task(task_id)
    }

    async fn run_to_embedding(fx: &Fixture, tenant: Uuid) -> (String, Vec<Uuid>) {
        let receipt = fx
            .pipeline
            .begin_ingestion(tenant, ingest_request(Some("col_a")), None)
            .await
            .unwrap();
        fx.pipeline
            .handle(extraction_callback(&receipt.task_id, tenant))
            .await
            .unwrap();
        let task = fx
            .pipeline
            .task_store()
            .load(&receipt.task_id)
            .await
            .unwrap()
            .unwrap();
        let chunk_ids = task
            .chunks
            .as_ref()
            .unwrap()
            .iter()
            .map(|c| c.chunk_id)
            .collect();
        (receipt.task_id, chunk_ids)
    }

    #[tokio::test]
    async fn begin_returns_processing_and_dispatches_extraction() {
        let fx = fixture();
        let tenant = Uuid::new_v4();
        let receipt = fx
            .pipeline
            .begin_ingestion(tenant, ingest_request(None), None)
            .await
            .unwrap();

        assert_eq!(receipt.status, "processing");
        assert!(receipt.collection_id.starts_with("col_"));

        let published = fx.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].action_type, types::EXTRACTION_PROCESS);
        assert_eq!(
            published[0].callback_action_type.as_deref(),
            Some("ingestion.extraction.response")
        );

        let task = fx
            .pipeline
            .task_store()
            .load(&receipt.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, IngestionStatus::Extracting);
        assert_eq!(task.percentage, 20);
    }

    #[tokio::test]
    async fn collection_mismatch_is_rejected_before_any_work() {
        let fx = fixture();
        let tenant = Uuid::new_v4();
        fx.store.push_document(DocumentRecord {
            document_id: Uuid::new_v4(),
            tenant_id: tenant,
            collection_id: "col_y".into(),
            document_name: "old.pdf".into(),
            document_type: "pdf".into(),
            embedding_model: "text-embedding-3-small".into(),
            embedding_dimensions: 1536,
            chunk_size: 512,
            chunk_overlap: 50,
            status: "completed".into(),
            total_chunks: 4,
            processed_chunks: 4,
            agent_ids: vec![],
            metadata: None,
            created_at: Utc::now(),
        });

        let mut request = ingest_request(Some("col_y"));
        request.embedding_model = "text-embedding-3-large".into();
        let err = fx
            .pipeline
            .begin_ingestion(tenant, request, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Integrity(_)));
        assert!(fx.publisher.published().is_empty(), "no work was started");
    }

    #[tokio::test]
    async fn extraction_failure_fails_the_task() {
        let fx = fixture();
        let tenant = Uuid::new_v4();
        let receipt = fx
            .pipeline
            .begin_ingestion(tenant, ingest_request(Some("col_a")), None)
            .await
            .unwrap();

        let callback = DomainAction::new(
            types::EXTRACTION_RESPONSE,
            ServiceName::Extraction,
            tenant,
            serde_json::json!({
                "status": "failed",
                "error": {
                    "error_type": "pdf_parse_error",
                    "message": "broken xref table",
                    "stage": "fallback_extraction",
                    "recoverable": false,
                },
            }),
        )
        .with_task(&receipt.task_id);
        fx.pipeline.handle(callback).await.unwrap();

        let task = fx
            .pipeline
            .task_store()
            .load(&receipt.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, IngestionStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("broken xref"));
    }

    #[tokio::test]
    async fn full_pipeline_reaches_completed_with_vectors_and_metadata() {
        let fx = fixture();
        let tenant = Uuid::new_v4();
        let (task_id, chunk_ids) = run_to_embedding(&fx, tenant).await;
        assert!(!chunk_ids.is_empty());

        // Embedding was requested for every chunk content.
        let embed_dispatch = fx
            .publisher
            .published()
            .into_iter()
            .find(|a| a.action_type == types::EMBEDDING_BATCH)
            .expect("embedding dispatched");
        assert_eq!(
            embed_dispatch.data["chunk_ids"].as_array().unwrap().len(),
            chunk_ids.len()
        );

        fx.pipeline
            .handle(embedding_callback(&task_id, tenant, &chunk_ids))
            .await
            .unwrap();

        let task = fx
            .pipeline
            .task_store()
            .load(&task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, IngestionStatus::Completed);
        assert_eq!(task.percentage, 100);
        assert_eq!(task.processed_chunks, chunk_ids.len());
        assert!(task.chunks.is_none(), "in-flight payload cleared");

        // Vectors carry the task's agents; metadata row exists once.
        assert_eq!(fx.index.len(), chunk_ids.len());
        let stored = fx.index.get(&chunk_ids[0]).unwrap();
        assert_eq!(stored.tenant_id, tenant);
        assert_eq!(fx.store.document_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_embedding_callback_is_idempotent() {
        let fx = fixture();
        let tenant = Uuid::new_v4();
        let (task_id, chunk_ids) = run_to_embedding(&fx, tenant).await;

        fx.pipeline
            .handle(embedding_callback(&task_id, tenant, &chunk_ids))
            .await
            .unwrap();
        fx.pipeline
            .handle(embedding_callback(&task_id, tenant, &chunk_ids))
            .await
            .unwrap();

        assert_eq!(fx.index.len(), chunk_ids.len());
        assert_eq!(fx.store.document_count(), 1);
        let task = fx
            .pipeline
            .task_store()
            .load(&task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, IngestionStatus::Completed);
    }

    #[tokio::test]
    async fn partial_embedding_failures_drop_those_chunks() {
        let fx = fixture();
        let tenant = Uuid::new_v4();
        let (task_id, chunk_ids) = run_to_embedding(&fx, tenant).await;
        if chunk_ids.len() < 2 {
            // One big chunk: nothing to partially fail.
            return;
        }

        let mut rows: Vec<serde_json::Value> = chunk_ids
            .iter()
            .skip(1)
            .map(|id| serde_json::json!({"chunk_id": id, "embedding": [0.5, 0.5, 0.5]}))
            .collect();
        rows.insert(
            0,
            serde_json::json!({"chunk_id": chunk_ids[0], "error": "text too long"}),
        );
        let callback = DomainAction::new(
            types::EMBEDDING_RESPONSE,
            ServiceName::Embedding,
            tenant,
            serde_json::json!({
                "embeddings": rows,
                "model": "text-embedding-3-small",
                "dimensions": 3,
                "usage": {"prompt_tokens": 10, "completion_tokens": 0, "total_tokens": 10},
                "processing_time_ms": 8,
            }),
        )
        .with_task(&task_id);
        fx.pipeline.handle(callback).await.unwrap();

        let task = fx
            .pipeline
            .task_store()
            .load(&task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, IngestionStatus::Completed);
        assert!(task.failed_ids.contains(&chunk_ids[0]));
        assert_eq!(fx.index.len(), chunk_ids.len() - 1);
        assert!(!fx.index.contains(&chunk_ids[0]));
    }

    #[tokio::test]
    async fn overlap_must_stay_below_chunk_size() {
        let fx = fixture();
        let mut request = ingest_request(None);
        request.chunk_overlap = 512;
        assert!(matches!(
            fx.pipeline
                .begin_ingestion(Uuid::new_v4(), request, None)
                .await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn delete_document_removes_vectors_and_metadata() {
        let fx = fixture();
        let tenant = Uuid::new_v4();
        let (task_id, chunk_ids) = run_to_embedding(&fx, tenant).await;
        fx.pipeline
            .handle(embedding_callback(&task_id, tenant, &chunk_ids))
            .await
            .unwrap();
        let task = fx
            .pipeline
            .task_store()
            .load(&task_id)
            .await
            .unwrap()
            .unwrap();

        fx.pipeline
            .delete_document(tenant, &task.collection_id, task.document_id)
            .await
            .unwrap();
        assert!(fx.index.is_empty());
        assert_eq!(fx.store.document_count(), 0);
    }
}
