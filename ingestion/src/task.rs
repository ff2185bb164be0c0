use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::cache::{keys, JsonStore};
use common::error::AppError;
use common::model::DocumentType;
use common::ws::IngestionProgress;
use vector_index::ChunkModel;

/// Pipeline stages in order. Transitions are forward-only, except that any
/// non-terminal stage may fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionStatus {
    Pending,
    Extracting,
    Chunking,
    Embedding,
    Storing,
    Completed,
    Failed,
}

impl IngestionStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Extracting => 1,
            Self::Chunking => 2,
            Self::Embedding => 3,
            Self::Storing => 4,
            Self::Completed => 5,
            Self::Failed => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition(&self, to: IngestionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Self::Failed || to.rank() > self.rank()
    }

    pub fn percentage(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Extracting => 20,
            Self::Chunking => 30,
            Self::Embedding => 40,
            Self::Storing => 80,
            Self::Completed => 100,
            Self::Failed => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Extracting => "extracting",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Storing => "storing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Per-task pipeline state, cached under `ingestion:task:{task_id}`. The
/// chunk list rides along only between the chunking and storing stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionTask {
    pub task_id: String,
    pub document_id: Uuid,
    pub tenant_id: Uuid,
    pub collection_id: String,
    pub agent_ids: Vec<Uuid>,
    pub document_name: String,
    pub document_type: DocumentType,
    pub embedding_model: String,
    pub embedding_dimensions: u32,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub status: IngestionStatus,
    pub percentage: u8,
    pub message: String,
    pub total_chunks: usize,
    pub processed_chunks: usize,
    #[serde(default)]
    pub failed_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkModel>>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestionTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        document_id: Uuid,
        tenant_id: Uuid,
        collection_id: String,
        agent_ids: Vec<Uuid>,
        document_name: String,
        document_type: DocumentType,
        embedding_model: String,
        embedding_dimensions: u32,
        chunk_size: usize,
        chunk_overlap: usize,
        file_path: String,
        user_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            document_id,
            tenant_id,
            collection_id,
            agent_ids,
            document_name,
            document_type,
            embedding_model,
            embedding_dimensions,
            chunk_size,
            chunk_overlap,
            file_path,
            user_id,
            status: IngestionStatus::Pending,
            percentage: 0,
            message: "queued".to_string(),
            total_chunks: 0,
            processed_chunks: 0,
            failed_ids: Vec::new(),
            error: None,
            chunks: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn transition(
        &mut self,
        to: IngestionStatus,
        message: impl Into<String>,
    ) -> Result<(), AppError> {
        if !self.status.can_transition(to) {
            return Err(AppError::Integrity(format!(
                "invalid status transition {} -> {}",
                self.status.as_str(),
                to.as_str()
            )));
        }
        self.status = to;
        self.percentage = if to == IngestionStatus::Failed {
            self.percentage
        } else {
            to.percentage()
        };
        self.message = message.into();
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        let error = error.into();
        // Failure from a terminal state is a no-op; the first verdict wins.
        if self.status.can_transition(IngestionStatus::Failed) {
            self.status = IngestionStatus::Failed;
            self.message = "ingestion failed".to_string();
            self.error = Some(error);
            self.chunks = None;
            self.updated_at = Utc::now();
        }
    }

    pub fn progress_frame(&self) -> IngestionProgress {
        IngestionProgress {
            task_id: self.task_id.clone(),
            status: self.status.as_str().to_string(),
            message: self.message.clone(),
            percentage: self.percentage,
            total_chunks: self.total_chunks,
            processed_chunks: self.processed_chunks,
            error: self.error.clone(),
        }
    }
}

/// Task-state persistence with a TTL comfortably above the pipeline's
/// expected duration.
pub struct TaskStore {
    store: JsonStore,
    ttl_secs: u64,
}

impl TaskStore {
    pub fn new(store: JsonStore, ttl_secs: u64) -> Self {
        Self {
            store,
            ttl_secs: ttl_secs.max(3600),
        }
    }

    pub async fn save(&self, task: &IngestionTask) -> Result<(), AppError> {
        self.store
            .put(&keys::ingestion_task(&task.task_id), task, self.ttl_secs)
            .await
    }

    pub async fn load(&self, task_id: &str) -> Result<Option<IngestionTask>, AppError> {
        self.store.get(&keys::ingestion_task(task_id)).await
    }
}
