use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use common::action::payload::{types, ActionPayload};
use common::action::{DomainAction, ServiceName};
use common::error::AppError;
use common::transport::ActionHandler;
use common::ws::{ChatStreaming, ServerFrame};

use crate::session::SessionHandler;
use crate::streaming::plan_stream_slices;
use crate::ws::WebSocketManager;

#[derive(Debug, Clone)]
pub struct StreamingSettings {
    pub enabled: bool,
    pub chunk_size: usize,
    pub delay_ms: u64,
}

/// Callback worker: routes execution replies onto the live WebSocket and
/// settles the session's active task.
pub struct OrchestratorCallbacks {
    sessions: Arc<SessionHandler>,
    ws: Arc<WebSocketManager>,
    streaming: StreamingSettings,
}

impl OrchestratorCallbacks {
    pub fn new(
        sessions: Arc<SessionHandler>,
        ws: Arc<WebSocketManager>,
        streaming: StreamingSettings,
    ) -> Self {
        Self {
            sessions,
            ws,
            streaming,
        }
    }

    async fn handle_chat_response(&self, action: DomainAction) -> Result<(), AppError> {
        let ActionPayload::ChatResponse(response) =
            ActionPayload::decode(&action.action_type, &action.data)?
        else {
            return Err(AppError::Validation("expected chat response".into()));
        };
        let session_id = action
            .session_id
            .clone()
            .ok_or_else(|| AppError::Validation("chat response without session_id".into()))?;
        let task_id = action.task_id.clone().unwrap_or_default();

        if self.streaming.enabled {
            if let Some(slices) =
                plan_stream_slices(&response.message.content, self.streaming.chunk_size)
            {
                let last = slices.len() - 1;
                for (index, slice) in slices.into_iter().enumerate() {
                    self.ws
                        .send(
                            &session_id,
                            ServerFrame::ChatStreaming(ChatStreaming {
                                task_id: task_id.clone(),
                                content: slice,
                                chunk_index: index as u32,
                                is_final: index == last,
                            }),
                        )
                        .await;
                    if index != last && self.streaming.delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(self.streaming.delay_ms)).await;
                    }
                }
            }
        }

        let delivered = self
            .ws
            .send(&session_id, ServerFrame::ChatResponse(Box::new(response)))
            .await;
        if !delivered {
            debug!(%session_id, "no live socket for chat response");
        }

        let matched = self.sessions.finish_task(&session_id, &task_id).await;
        if !matched {
            // A newer turn superseded this task; the frame was still
            // delivered because sessions, not tasks, own the socket.
            debug!(%session_id, %task_id, "stale task callback");
        }
        Ok(())
    }

    async fn handle_chat_error(&self, action: DomainAction) -> Result<(), AppError> {
        let ActionPayload::ChatError(info) =
            ActionPayload::decode(&action.action_type, &action.data)?
        else {
            return Err(AppError::Validation("expected chat error".into()));
        };
        let session_id = action
            .session_id
            .clone()
            .ok_or_else(|| AppError::Validation("chat error without session_id".into()))?;
        let task_id = action.task_id.clone().unwrap_or_default();

        self.ws
            .send(&session_id, ServerFrame::ChatError(info.clone()))
            .await;
        self.sessions.finish_task(&session_id, &task_id).await;
        self.sessions.record_error(&session_id, info).await;
        Ok(())
    }
}

#[async_trait]
impl ActionHandler for OrchestratorCallbacks {
    fn service(&self) -> ServiceName {
        ServiceName::Orchestrator
    }

    async fn handle(&self, action: DomainAction) -> Result<Option<DomainAction>, AppError> {
        match action.action_type.as_str() {
            types::CHAT_RESPONSE => self.handle_chat_response(action).await?,
            types::CHAT_ERROR => self.handle_chat_error(action).await?,
            other => {
                warn!(action_type = other, "unrecognized callback type");
            }
        }
        Ok(None)
    }
}
