use std::sync::Arc;

use serde_json::json;
use tracing::info;

use common::action::{payload::types, DomainAction, ServiceName};
use common::error::AppError;
use common::model::ChatRequest;
use common::transport::ActionPublisher;
use common::ws::{ChatProcessing, ServerFrame};

use crate::config_handler::AgentLookup;
use crate::session::SessionHandler;
use crate::ws::WebSocketManager;

/// Turns an inbound `chat_message` frame into an execution dispatch.
pub struct ChatHandler {
    sessions: Arc<SessionHandler>,
    configs: Arc<dyn AgentLookup>,
    ws: Arc<WebSocketManager>,
    publisher: Arc<dyn ActionPublisher>,
}

impl ChatHandler {
    pub fn new(
        sessions: Arc<SessionHandler>,
        configs: Arc<dyn AgentLookup>,
        ws: Arc<WebSocketManager>,
        publisher: Arc<dyn ActionPublisher>,
    ) -> Self {
        Self {
            sessions,
            configs,
            ws,
            publisher,
        }
    }

    pub async fn handle_chat_message(
        &self,
        session_id: &str,
        request: ChatRequest,
    ) -> Result<(), AppError> {
        if request.messages.is_empty() {
            return Err(AppError::Validation("messages must not be empty".into()));
        }

        let session = self.sessions.snapshot(session_id).await?;
        let task_id = self.sessions.begin_task(session_id).await?;
        let resolved = self.configs.agent_configs(session.agent_id).await?;

        let mode = if request.declares_tools() {
            types::CHAT_ADVANCE
        } else {
            types::CHAT_SIMPLE
        };

        self.ws
            .send(
                session_id,
                ServerFrame::ChatProcessing(ChatProcessing {
                    task_id: task_id.clone(),
                    session_id: session_id.to_string(),
                }),
            )
            .await;

        let mut action = DomainAction::new(
            mode,
            ServiceName::Orchestrator,
            session.tenant_id,
            json!({ "request": request }),
        )
        .with_session(session_id)
        .with_task(&task_id)
        .with_agent(session.agent_id);
        action.user_id = session.user_id.clone();
        action.execution_config = Some(resolved.execution_config);
        action.query_config = Some(resolved.query_config);
        action.rag_config = Some(resolved.rag_config);

        let action = self
            .publisher
            .publish_with_callback(action, "chat.response")
            .await?;

        info!(
            action_id = %action.action_id,
            action_type = %action.action_type,
            tenant_id = %session.tenant_id,
            session_id,
            task_id = %task_id,
            agent_id = %session.agent_id,
            "chat turn dispatched"
        );
        Ok(())
    }
}
