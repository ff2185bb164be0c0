use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::action::payload::{types, ActionPayload};
use common::action::{DomainAction, ServiceName};
use common::cache::{keys, JsonStore};
use common::error::{AppError, ErrorInfo};
use common::model::{ChatMessage, ChatResponse, ExecutionConfig};
use common::transport::{ActionHandler, ActionPublisher};

use crate::history::{integrate_messages, HistoryStore};

/// Continuation state parked in the cache between the query dispatch and
/// its callback. Keyed by the dispatched action id.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingChat {
    callback_action_type: String,
    tenant_id: Uuid,
    session_id: Option<String>,
    task_id: Option<String>,
    agent_id: Option<Uuid>,
    user_id: Option<String>,
    conversation_id: Uuid,
    user_message: ChatMessage,
    execution_config: ExecutionConfig,
    started_at: DateTime<Utc>,
    cancelled: bool,
}

/// Chat skeleton shared by the simple and advance modes: history in, query
/// out, response assembly on the way back.
pub struct ExecutionHandler {
    publisher: Arc<dyn ActionPublisher>,
    history: HistoryStore,
    pending: JsonStore,
    pending_ttl_secs: u64,
}

impl ExecutionHandler {
    pub fn new(
        publisher: Arc<dyn ActionPublisher>,
        history: HistoryStore,
        pending: JsonStore,
        pending_ttl_secs: u64,
    ) -> Self {
        Self {
            publisher,
            history,
            pending,
            pending_ttl_secs,
        }
    }

    async fn handle_chat(&self, action: DomainAction) -> Result<(), AppError> {
        let ActionPayload::ChatExecute(payload) =
            ActionPayload::decode(&action.action_type, &action.data)?
        else {
            return Err(AppError::Validation("expected chat payload".into()));
        };
        let callback_action_type = action
            .callback_action_type
            .clone()
            .ok_or_else(|| AppError::Validation("chat action requires a callback".into()))?;
        let session_id = action
            .session_id
            .clone()
            .ok_or_else(|| AppError::Validation("chat action without session_id".into()))?;
        let agent_id = action
            .agent_id
            .ok_or_else(|| AppError::Validation("chat action without agent_id".into()))?;
        let user_message = payload
            .request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == common::model::MessageRole::User)
            .cloned()
            .ok_or_else(|| AppError::Validation("no user message in request".into()))?;

        let execution_config = action.execution_config.clone().unwrap_or_default();

        let history = self
            .history
            .get_or_create(action.tenant_id, &session_id, agent_id)
            .await?;
        let integrated = integrate_messages(
            &history.messages,
            &payload.request.messages,
            execution_config.max_history_length,
        );

        let mode = if action.action_type == types::CHAT_ADVANCE {
            types::GENERATE_ADVANCE
        } else {
            types::GENERATE_SIMPLE
        };

        let mut query_action = DomainAction::new(
            mode,
            ServiceName::Execution,
            action.tenant_id,
            json!({
                "messages": integrated,
                "conversation_id": history.conversation_id,
            }),
        )
        .with_session(&session_id)
        .with_agent(agent_id)
        .with_correlation(action.action_id);
        query_action.task_id = action.task_id.clone();
        query_action.user_id = action.user_id.clone();
        query_action.query_config = action.query_config.clone();
        query_action.rag_config = action.rag_config.clone();

        let query_action = self
            .publisher
            .publish_with_callback(query_action, "query.response")
            .await?;

        let pending = PendingChat {
            callback_action_type,
            tenant_id: action.tenant_id,
            session_id: Some(session_id.clone()),
            task_id: action.task_id.clone(),
            agent_id: Some(agent_id),
            user_id: action.user_id.clone(),
            conversation_id: history.conversation_id,
            user_message,
            execution_config,
            started_at: Utc::now(),
            cancelled: false,
        };
        self.pending
            .put(
                &keys::pending_chat(&query_action.action_id),
                &pending,
                self.pending_ttl_secs,
            )
            .await?;

        info!(
            action_id = %action.action_id,
            action_type = %action.action_type,
            tenant_id = %action.tenant_id,
            session_id = %session_id,
            task_id = action.task_id.as_deref().unwrap_or(""),
            agent_id = %agent_id,
            "query dispatched"
        );
        Ok(())
    }

    async fn complete_chat(
        &self,
        action: DomainAction,
    ) -> Result<Option<DomainAction>, AppError> {
        let ActionPayload::QueryResult(result) =
            ActionPayload::decode(&action.action_type, &action.data)?
        else {
            return Err(AppError::Validation("expected query result".into()));
        };
        let Some(pending) = self.take_pending(&action).await? else {
            return Ok(None);
        };
        if pending.cancelled {
            debug!(
                correlation_id = ?action.correlation_id,
                "dropping result for cancelled task"
            );
            return Ok(None);
        }

        let assistant = ChatMessage::assistant(result.content.clone());
        let execution_time_ms = (Utc::now() - pending.started_at).num_milliseconds().max(0) as u64;
        let response = ChatResponse {
            conversation_id: pending.conversation_id,
            message: assistant.clone(),
            usage: result.usage,
            sources: result.sources,
            execution_time_ms,
            metadata: None,
        };

        if let (Some(session_id), Some(agent_id)) = (&pending.session_id, pending.agent_id) {
            let mut history = self
                .history
                .get_or_create(pending.tenant_id, session_id, agent_id)
                .await?;
            history.append_exchange(pending.user_message.clone(), assistant.clone());
            self.history
                .save(&history, pending.execution_config.history_ttl)
                .await?;
        }

        // Fire-and-forget persistence; a failure here never blocks the
        // reply owed to the orchestrator.
        let mut persist = DomainAction::new(
            types::MESSAGE_CREATE,
            ServiceName::Execution,
            pending.tenant_id,
            json!({
                "conversation_id": pending.conversation_id,
                "user_message": pending.user_message,
                "agent_message": assistant,
                "metadata": { "execution_time_ms": execution_time_ms },
            }),
        );
        persist.session_id = pending.session_id.clone();
        persist.agent_id = pending.agent_id;
        persist.user_id = pending.user_id.clone();
        if let Err(err) = self.publisher.publish(&persist).await {
            warn!(error = %err, "conversation persistence dispatch failed");
        }

        let mut reply = DomainAction::new(
            pending.callback_action_type.clone(),
            ServiceName::Execution,
            pending.tenant_id,
            serde_json::to_value(&response)?,
        );
        reply.session_id = pending.session_id;
        reply.task_id = pending.task_id;
        reply.agent_id = pending.agent_id;
        reply.user_id = pending.user_id;
        reply.correlation_id = action.correlation_id;
        Ok(Some(reply))
    }

    async fn fail_chat(&self, action: DomainAction) -> Result<Option<DomainAction>, AppError> {
        let info: ErrorInfo = serde_json::from_value(action.data.clone()).unwrap_or(ErrorInfo {
            error_type: "external_service_error".into(),
            message: "query failed".into(),
            details: None,
        });
        let Some(pending) = self.take_pending(&action).await? else {
            return Ok(None);
        };
        if pending.cancelled {
            debug!(
                correlation_id = ?action.correlation_id,
                "dropping error for cancelled task"
            );
            return Ok(None);
        }

        let error_type =
            common::transport::consumer::error_action_type(&pending.callback_action_type);
        let mut reply = DomainAction::new(
            error_type,
            ServiceName::Execution,
            pending.tenant_id,
            serde_json::to_value(&info)?,
        );
        reply.session_id = pending.session_id;
        reply.task_id = pending.task_id;
        reply.agent_id = pending.agent_id;
        reply.user_id = pending.user_id;
        Ok(Some(reply))
    }

    async fn take_pending(&self, action: &DomainAction) -> Result<Option<PendingChat>, AppError> {
        let Some(correlation_id) = action.correlation_id else {
            warn!(action_type = %action.action_type, "callback without correlation id");
            return Ok(None);
        };
        let pending: Option<PendingChat> = self
            .pending
            .take(&keys::pending_chat(&correlation_id))
            .await?;
        if pending.is_none() {
            debug!(%correlation_id, "no pending chat for callback (stale or cancelled)");
        }
        Ok(pending)
    }

    async fn cancel_task(&self, action: DomainAction) -> Result<(), AppError> {
        let ActionPayload::TaskCancel(payload) =
            ActionPayload::decode(&action.action_type, &action.data)?
        else {
            return Err(AppError::Validation("expected cancel payload".into()));
        };
        // Advisory: in-flight provider calls drain. The record stays, marked
        // cancelled, so whichever callback arrives takes it, observes the
        // flag and drops the reply.
        if let Some(correlation_id) = action.correlation_id {
            let key = keys::pending_chat(&correlation_id);
            if let Some(mut pending) = self.pending.get::<PendingChat>(&key).await? {
                pending.cancelled = true;
                self.pending.put(&key, &pending, self.pending_ttl_secs).await?;
            }
        }
        info!(task_id = %payload.task_id, "task cancel recorded");
        Ok(())
    }

    async fn relay_session_closed(&self, action: DomainAction) -> Result<(), AppError> {
        let ActionPayload::SessionClosed(mut payload) =
            ActionPayload::decode(&action.action_type, &action.data)?
        else {
            return Err(AppError::Validation("expected session close payload".into()));
        };
        // The closing conversation's id lives in the cached history.
        if payload.conversation_id.is_none() {
            if let Some(agent_id) = action.agent_id {
                if let Ok(history) = self
                    .history
                    .get_or_create(action.tenant_id, &payload.session_id, agent_id)
                    .await
                {
                    payload.conversation_id = Some(history.conversation_id);
                }
            }
        }

        let mut relay = DomainAction::new(
            types::CONVERSATION_CLOSED,
            ServiceName::Execution,
            action.tenant_id,
            serde_json::to_value(&payload)?,
        );
        relay.session_id = action.session_id.clone();
        relay.agent_id = action.agent_id;
        if let Err(err) = self.publisher.publish(&relay).await {
            warn!(error = %err, "session close relay failed");
        }
        Ok(())
    }
}

#[async_trait]
impl ActionHandler for ExecutionHandler {
    fn service(&self) -> ServiceName {
        ServiceName::Execution
    }

    async fn handle(&self, action: DomainAction) -> Result<Option<DomainAction>, AppError> {
        match action.action_type.as_str() {
            types::CHAT_SIMPLE | types::CHAT_ADVANCE => {
                self.handle_chat(action).await?;
                Ok(None)
            }
            types::QUERY_RESPONSE => self.complete_chat(action).await,
            types::QUERY_ERROR => self.fail_chat(action).await,
            types::TASK_CANCEL => {
                self.cancel_task(action).await?;
                Ok(None)
            }
            types::SESSION_CLOSED => {
                self.relay_session_closed(action).await?;
                Ok(None)
            }
            other => {
                warn!(action_type = other, "unrecognized action");
                Ok(None)
            }
        }
    }
}
