use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, ErrorInfo, ExtractionFailure};
use crate::model::{
    ChatMessage, ChatRequest, ChatResponse, DocumentType, ExtractionOutcome, TokenUsage,
};

pub mod types {
    pub const CHAT_SIMPLE: &str = "execution.chat.simple";
    pub const CHAT_ADVANCE: &str = "execution.chat.advance";
    pub const CHAT_RESPONSE: &str = "orchestrator.chat.response";
    pub const CHAT_ERROR: &str = "orchestrator.chat.error";
    pub const SESSION_CLOSED: &str = "execution.session.closed";
    pub const TASK_CANCEL: &str = "execution.task.cancel";
    pub const QUERY_RESPONSE: &str = "execution.query.response";
    pub const QUERY_ERROR: &str = "execution.query.error";

    pub const GENERATE_SIMPLE: &str = "query.generate.simple";
    pub const GENERATE_ADVANCE: &str = "query.generate.advance";
    pub const QUERY_EMBEDDING_RESPONSE: &str = "query.embedding.response";
    pub const QUERY_EMBEDDING_ERROR: &str = "query.embedding.error";

    pub const EMBEDDING_BATCH: &str = "embedding.batch_process";
    pub const EMBEDDING_QUERY: &str = "embedding.generate_query";

    pub const EXTRACTION_PROCESS: &str = "extraction.document.process";

    pub const DOCUMENT_INGEST: &str = "ingestion.document.ingest";
    pub const EXTRACTION_RESPONSE: &str = "ingestion.extraction.response";
    pub const EMBEDDING_RESPONSE: &str = "ingestion.embedding.response";

    pub const MESSAGE_CREATE: &str = "conversation.message.create";
    pub const CONVERSATION_CLOSED: &str = "conversation.session.closed";
}

/// Chat turn handed from the orchestrator to the execution service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatExecutePayload {
    pub request: ChatRequest,
}

/// Integrated message list handed from execution to query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryGeneratePayload {
    pub messages: Vec<ChatMessage>,
    pub conversation_id: Uuid,
}

/// Generation result handed back from query to execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResultPayload {
    pub content: String,
    pub usage: TokenUsage,
    pub sources: Vec<Uuid>,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingBatchPayload {
    pub texts: Vec<String>,
    pub chunk_ids: Vec<Uuid>,
    pub model: String,
    pub dimensions: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingQueryPayload {
    pub input: String,
}

/// One row per requested text: either an embedding or a per-chunk error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRow {
    pub chunk_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResultPayload {
    pub embeddings: Vec<EmbeddingRow>,
    pub model: String,
    pub dimensions: u32,
    pub usage: TokenUsage,
    pub processing_time_ms: u64,
}

impl EmbeddingResultPayload {
    /// The batch succeeds as a whole if at least one embedding came back.
    pub fn any_succeeded(&self) -> bool {
        self.embeddings.iter().any(|row| row.embedding.is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageModelSize {
    Medium,
    Large,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionProcessPayload {
    pub file_path: String,
    pub document_name: String,
    pub document_type: DocumentType,
    pub language_model_size: LanguageModelSize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResultPayload {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ExtractionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExtractionFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Completed,
    Failed,
}

/// Ingest request as it rides the stream; HTTP routes build the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentIngestPayload {
    pub document_name: String,
    pub document_type: DocumentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    pub embedding_model: String,
    pub embedding_dimensions: u32,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub agent_ids: Vec<Uuid>,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessagePayload {
    pub conversation_id: Uuid,
    pub user_message: ChatMessage,
    pub agent_message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClosedPayload {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancelPayload {
    pub task_id: String,
}

/// Every action type mapped to its payload schema. Handlers decode through
/// this instead of reaching into raw JSON maps.
#[derive(Debug, Clone)]
pub enum ActionPayload {
    ChatExecute(ChatExecutePayload),
    ChatResponse(ChatResponse),
    ChatError(ErrorInfo),
    SessionClosed(SessionClosedPayload),
    TaskCancel(TaskCancelPayload),
    QueryGenerate(QueryGeneratePayload),
    QueryResult(QueryResultPayload),
    QueryError(ErrorInfo),
    EmbeddingBatch(EmbeddingBatchPayload),
    EmbeddingQuery(EmbeddingQueryPayload),
    EmbeddingResult(EmbeddingResultPayload),
    EmbeddingError(ErrorInfo),
    ExtractionProcess(ExtractionProcessPayload),
    ExtractionResult(ExtractionResultPayload),
    DocumentIngest(DocumentIngestPayload),
    ConversationMessage(ConversationMessagePayload),
    ConversationClosed(SessionClosedPayload),
}

impl ActionPayload {
    pub fn decode(action_type: &str, data: &serde_json::Value) -> Result<Self, AppError> {
        let decoded = match action_type {
            types::CHAT_SIMPLE | types::CHAT_ADVANCE => {
                Self::ChatExecute(from_value(action_type, data)?)
            }
            types::CHAT_RESPONSE => Self::ChatResponse(from_value(action_type, data)?),
            types::CHAT_ERROR => Self::ChatError(from_value(action_type, data)?),
            types::SESSION_CLOSED => Self::SessionClosed(from_value(action_type, data)?),
            types::TASK_CANCEL => Self::TaskCancel(from_value(action_type, data)?),
            types::GENERATE_SIMPLE | types::GENERATE_ADVANCE => {
                Self::QueryGenerate(from_value(action_type, data)?)
            }
            types::QUERY_RESPONSE => Self::QueryResult(from_value(action_type, data)?),
            types::QUERY_ERROR => Self::QueryError(from_value(action_type, data)?),
            types::EMBEDDING_BATCH => Self::EmbeddingBatch(from_value(action_type, data)?),
            types::EMBEDDING_QUERY => Self::EmbeddingQuery(from_value(action_type, data)?),
            types::EMBEDDING_RESPONSE | types::QUERY_EMBEDDING_RESPONSE => {
                Self::EmbeddingResult(from_value(action_type, data)?)
            }
            types::QUERY_EMBEDDING_ERROR => Self::EmbeddingError(from_value(action_type, data)?),
            types::EXTRACTION_PROCESS => Self::ExtractionProcess(from_value(action_type, data)?),
            types::EXTRACTION_RESPONSE => Self::ExtractionResult(from_value(action_type, data)?),
            types::DOCUMENT_INGEST => Self::DocumentIngest(from_value(action_type, data)?),
            types::MESSAGE_CREATE => Self::ConversationMessage(from_value(action_type, data)?),
            types::CONVERSATION_CLOSED => {
                Self::ConversationClosed(from_value(action_type, data)?)
            }
            other => {
                return Err(AppError::Validation(format!(
                    "no payload schema registered for action_type '{other}'"
                )))
            }
        };
        Ok(decoded)
    }
}

fn from_value<T: serde::de::DeserializeOwned>(
    action_type: &str,
    data: &serde_json::Value,
) -> Result<T, AppError> {
    serde_json::from_value(data.clone()).map_err(|err| {
        AppError::Validation(format!("invalid payload for '{action_type}': {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageRole;
    use serde_json::json;

    #[test]
    fn decodes_chat_execute() {
        let data = json!({
            "request": {"messages": [{"role": "user", "content": "hi"}]}
        });
        match ActionPayload::decode(types::CHAT_SIMPLE, &data).unwrap() {
            ActionPayload::ChatExecute(payload) => {
                assert_eq!(payload.request.messages.len(), 1);
                assert_eq!(payload.request.messages[0].role, MessageRole::User);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn decodes_embedding_batch_and_result() {
        let chunk_id = Uuid::new_v4();
        let batch = json!({
            "texts": ["alpha"],
            "chunk_ids": [chunk_id],
            "model": "text-embedding-3-small",
            "dimensions": 1536
        });
        assert!(matches!(
            ActionPayload::decode(types::EMBEDDING_BATCH, &batch).unwrap(),
            ActionPayload::EmbeddingBatch(_)
        ));

        let result = json!({
            "embeddings": [{"chunk_id": chunk_id, "embedding": [0.1, 0.2]}],
            "model": "text-embedding-3-small",
            "dimensions": 1536,
            "usage": {"prompt_tokens": 3, "completion_tokens": 0, "total_tokens": 3},
            "processing_time_ms": 12
        });
        match ActionPayload::decode(types::EMBEDDING_RESPONSE, &result).unwrap() {
            ActionPayload::EmbeddingResult(payload) => assert!(payload.any_succeeded()),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn partial_failure_batch_still_counts_as_success() {
        let payload = EmbeddingResultPayload {
            embeddings: vec![
                EmbeddingRow {
                    chunk_id: Uuid::new_v4(),
                    embedding: None,
                    error: Some("text too long".into()),
                },
                EmbeddingRow {
                    chunk_id: Uuid::new_v4(),
                    embedding: Some(vec![0.5]),
                    error: None,
                },
            ],
            model: "text-embedding-3-small".into(),
            dimensions: 1536,
            usage: TokenUsage::default(),
            processing_time_ms: 1,
        };
        assert!(payload.any_succeeded());
    }

    #[test]
    fn unknown_action_type_is_rejected() {
        assert!(ActionPayload::decode("billing.run", &json!({})).is_err());
    }

    #[test]
    fn malformed_payload_is_a_validation_error() {
        let err = ActionPayload::decode(types::EMBEDDING_BATCH, &json!({"texts": 3})).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
