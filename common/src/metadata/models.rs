use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ExecutionConfig, QueryConfig, RagConfig};

/// Row of the `agents_with_prompt` view: agent identity plus its three
/// resolved configs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: Uuid,
    pub tenant_id: Uuid,
    pub agent_name: String,
    pub is_public: bool,
    pub execution_config: ExecutionConfig,
    pub query_config: QueryConfig,
    pub rag_config: RagConfig,
}

/// Row of `documents_rag`, one per ingested document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: Uuid,
    pub tenant_id: Uuid,
    pub collection_id: String,
    pub document_name: String,
    pub document_type: String,
    pub embedding_model: String,
    pub embedding_dimensions: u32,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub status: String,
    pub total_chunks: usize,
    pub processed_chunks: usize,
    pub agent_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation_id: Uuid,
    pub tenant_id: Uuid,
    pub session_id: String,
    pub agent_id: Uuid,
    #[serde(default)]
    pub closed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Operation argument of the `update_document_agents` RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentIdsOperation {
    Set,
    Add,
    Remove,
}
