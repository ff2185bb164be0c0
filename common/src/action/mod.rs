pub mod payload;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::model::{ExecutionConfig, QueryConfig, RagConfig};

/// Logical workers of the platform. The first dotted segment of an
/// `action_type` parses into one of these and selects the destination
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceName {
    Orchestrator,
    Execution,
    Query,
    Ingestion,
    Extraction,
    Embedding,
    Conversation,
}

impl ServiceName {
    pub const ALL: [ServiceName; 7] = [
        Self::Orchestrator,
        Self::Execution,
        Self::Query,
        Self::Ingestion,
        Self::Extraction,
        Self::Embedding,
        Self::Conversation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Execution => "execution",
            Self::Query => "query",
            Self::Ingestion => "ingestion",
            Self::Extraction => "extraction",
            Self::Embedding => "embedding",
            Self::Conversation => "conversation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "orchestrator" => Some(Self::Orchestrator),
            "execution" => Some(Self::Execution),
            "query" => Some(Self::Query),
            "ingestion" => Some(Self::Ingestion),
            "extraction" => Some(Self::Extraction),
            "embedding" => Some(Self::Embedding),
            "conversation" => Some(Self::Conversation),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only inter-service message. Context ids flow unchanged through every
/// hop of a causally related chain; `origin_service` plus
/// `callback_action_type` jointly determine the reply stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainAction {
    pub action_id: Uuid,
    pub action_type: String,
    pub origin_service: ServiceName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_action_type: Option<String>,

    pub tenant_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_config: Option<ExecutionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_config: Option<QueryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag_config: Option<RagConfig>,

    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl DomainAction {
    pub fn new(
        action_type: impl Into<String>,
        origin_service: ServiceName,
        tenant_id: Uuid,
        data: serde_json::Value,
    ) -> Self {
        Self {
            action_id: Uuid::new_v4(),
            action_type: action_type.into(),
            origin_service,
            callback_action_type: None,
            tenant_id,
            session_id: None,
            task_id: None,
            agent_id: None,
            user_id: None,
            execution_config: None,
            query_config: None,
            rag_config: None,
            data,
            metadata: serde_json::Value::Null,
            correlation_id: None,
            trace_id: None,
            created_at: Utc::now(),
        }
    }

    /// Sets the callback the destination handler owes a reply to:
    /// `<origin>.<event>` delivered on the origin's callback stream.
    pub fn with_callback(mut self, event: &str) -> Self {
        self.callback_action_type = Some(format!("{}.{}", self.origin_service, event));
        self
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn with_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Destination service derived from the action type's first segment.
    pub fn destination(&self) -> Result<ServiceName, AppError> {
        let head = self
            .action_type
            .split('.')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                AppError::Validation(format!("malformed action_type '{}'", self.action_type))
            })?;
        ServiceName::parse(head).ok_or_else(|| {
            AppError::Validation(format!(
                "action_type '{}' does not route to a known service",
                self.action_type
            ))
        })
    }

    /// Builds a reply carrying this action's context ids, addressed to the
    /// requested callback. `None` when the action is fire-and-forget.
    pub fn reply(&self, replier: ServiceName, data: serde_json::Value) -> Option<DomainAction> {
        let callback = self.callback_action_type.clone()?;
        Some(DomainAction {
            action_id: Uuid::new_v4(),
            action_type: callback,
            origin_service: replier,
            callback_action_type: None,
            tenant_id: self.tenant_id,
            session_id: self.session_id.clone(),
            task_id: self.task_id.clone(),
            agent_id: self.agent_id,
            user_id: self.user_id.clone(),
            execution_config: None,
            query_config: None,
            rag_config: None,
            data,
            metadata: serde_json::Value::Null,
            correlation_id: self.correlation_id.or(Some(self.action_id)),
            trace_id: self.trace_id,
            created_at: Utc::now(),
        })
    }
}
