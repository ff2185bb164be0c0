use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use common::action::payload::{ActionPayload, ConversationMessagePayload};
use common::action::{DomainAction, ServiceName};
use common::error::AppError;
use common::metadata::{ConversationRecord, MessageRecord, MetadataStore};
use common::transport::ActionHandler;

/// Fire-and-forget persistence of chat exchanges through the privileged
/// metadata client. Nothing here owes a reply; failures are logged by the
/// consumer and the exchange stays in the Redis-cached history.
pub struct ConversationHandler {
    store: Arc<dyn MetadataStore>,
}

impl ConversationHandler {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    async fn persist_exchange(
        &self,
        action: &DomainAction,
        payload: ConversationMessagePayload,
    ) -> Result<(), AppError> {
        let conversation = ConversationRecord {
            conversation_id: payload.conversation_id,
            tenant_id: action.tenant_id,
            session_id: action.session_id.clone().unwrap_or_default(),
            agent_id: action.agent_id.unwrap_or_default(),
            closed: false,
            created_at: Utc::now(),
        };
        // Idempotent: a duplicate delivery re-inserts the same
        // conversation id and the store swallows the conflict.
        self.store.insert_conversation(&conversation).await?;

        let records = [
            (&payload.user_message, "user"),
            (&payload.agent_message, "assistant"),
        ]
        .map(|(message, role)| MessageRecord {
            message_id: Uuid::new_v4(),
            conversation_id: payload.conversation_id,
            role: role.to_string(),
            content: message.content.clone(),
            metadata: payload.metadata.clone(),
            created_at: message.timestamp,
        });
        self.store.insert_messages(&records).await?;

        info!(
            conversation_id = %payload.conversation_id,
            tenant_id = %action.tenant_id,
            session_id = action.session_id.as_deref().unwrap_or(""),
            "exchange persisted"
        );
        Ok(())
    }
}

#[async_trait]
impl ActionHandler for ConversationHandler {
    fn service(&self) -> ServiceName {
        ServiceName::Conversation
    }

    async fn handle(&self, action: DomainAction) -> Result<Option<DomainAction>, AppError> {
        match ActionPayload::decode(&action.action_type, &action.data)? {
            ActionPayload::ConversationMessage(payload) => {
                self.persist_exchange(&action, payload).await?;
            }
            ActionPayload::ConversationClosed(payload) => {
                if let Some(conversation_id) = payload.conversation_id {
                    self.store.close_conversation(conversation_id).await?;
                    info!(%conversation_id, "conversation closed");
                } else {
                    info!(
                        session_id = %payload.session_id,
                        "session closed without a persisted conversation"
                    );
                }
            }
            _ => {
                warn!(action_type = %action.action_type, "unrecognized action");
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::action::payload::types;
    use common::metadata::InMemoryMetadataStore;
    use common::model::ChatMessage;
    use serde_json::json;

    fn message_action(conversation_id: Uuid) -> DomainAction {
        DomainAction::new(
            types::MESSAGE_CREATE,
            ServiceName::Execution,
            Uuid::new_v4(),
            json!({
                "conversation_id": conversation_id,
                "user_message": ChatMessage::user("What is the leave policy?"),
                "agent_message": ChatMessage::assistant("Twenty five days."),
                "metadata": {"execution_time_ms": 120},
            }),
        )
        .with_session("sess-1")
        .with_agent(Uuid::new_v4())
    }

    #[tokio::test]
    async fn persists_conversation_and_both_messages() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let handler = ConversationHandler::new(store.clone());
        let conversation_id = Uuid::new_v4();

        let reply = handler.handle(message_action(conversation_id)).await.unwrap();
        assert!(reply.is_none(), "fire-and-forget");

        assert_eq!(store.conversations.lock().unwrap().len(), 1);
        let messages = store.messages.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert!(messages.iter().all(|m| m.conversation_id == conversation_id));
    }

    #[tokio::test]
    async fn duplicate_delivery_keeps_one_conversation_row() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let handler = ConversationHandler::new(store.clone());
        let action = message_action(Uuid::new_v4());

        handler.handle(action.clone()).await.unwrap();
        handler.handle(action).await.unwrap();
        assert_eq!(store.conversations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn session_close_marks_conversation_closed() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let handler = ConversationHandler::new(store.clone());
        let conversation_id = Uuid::new_v4();
        handler.handle(message_action(conversation_id)).await.unwrap();

        let close = DomainAction::new(
            types::CONVERSATION_CLOSED,
            ServiceName::Execution,
            Uuid::new_v4(),
            json!({"session_id": "sess-1", "conversation_id": conversation_id}),
        );
        handler.handle(close).await.unwrap();

        let conversations = store.conversations.lock().unwrap();
        assert!(conversations[0].closed);
    }
}
