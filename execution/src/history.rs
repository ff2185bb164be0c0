use uuid::Uuid;

use common::cache::{keys, JsonStore};
use common::error::AppError;
use common::model::{ChatMessage, ConversationHistory, MessageRole};

/// Conversation histories keyed by `(tenant, session, agent)`, cached under
/// the TTL from the agent's execution config.
pub struct HistoryStore {
    store: JsonStore,
}

impl HistoryStore {
    pub fn new(store: JsonStore) -> Self {
        Self { store }
    }

    pub async fn get_or_create(
        &self,
        tenant_id: Uuid,
        session_id: &str,
        agent_id: Uuid,
    ) -> Result<ConversationHistory, AppError> {
        let key = keys::history(&tenant_id, session_id, &agent_id);
        if let Some(history) = self.store.get(&key).await? {
            return Ok(history);
        }
        Ok(ConversationHistory::new(tenant_id, session_id, agent_id))
    }

    pub async fn save(
        &self,
        history: &ConversationHistory,
        ttl_secs: u64,
    ) -> Result<(), AppError> {
        let key = keys::history(&history.tenant_id, &history.session_id, &history.agent_id);
        self.store.put(&key, history, ttl_secs).await
    }
}

/// Builds the message list sent to generation: cached history truncated to
/// `max_history`, its system messages collapsed into a single prefix, then
/// the incoming system and user messages in order.
pub fn integrate_messages(
    history: &[ChatMessage],
    incoming: &[ChatMessage],
    max_history: usize,
) -> Vec<ChatMessage> {
    let system_prefix: Vec<&str> = history
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| m.content.as_str())
        .collect();

    let turns: Vec<&ChatMessage> = history
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .collect();
    let truncated = &turns[turns.len().saturating_sub(max_history)..];

    let mut integrated = Vec::with_capacity(truncated.len() + incoming.len() + 1);
    if !system_prefix.is_empty() {
        integrated.push(ChatMessage::system(system_prefix.join("\n\n")));
    }
    integrated.extend(truncated.iter().map(|m| (*m).clone()));

    let (new_system, new_rest): (Vec<&ChatMessage>, Vec<&ChatMessage>) = incoming
        .iter()
        .partition(|m| m.role == MessageRole::System);
    integrated.extend(new_system.into_iter().cloned());
    integrated.extend(new_rest.into_iter().cloned());

    integrated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .flat_map(|i| {
                vec![
                    ChatMessage::user(format!("question {i}")),
                    ChatMessage::assistant(format!("answer {i}")),
                ]
            })
            .collect()
    }

    #[test]
    fn history_is_truncated_to_max_length() {
        let history = exchange(10);
        let incoming = vec![ChatMessage::user("latest")];
        let integrated = integrate_messages(&history, &incoming, 4);
        // 4 history turns plus the incoming message.
        assert_eq!(integrated.len(), 5);
        assert_eq!(integrated[0].content, "question 8");
        assert_eq!(integrated.last().unwrap().content, "latest");
    }

    #[test]
    fn system_messages_collapse_into_one_prefix() {
        let mut history = vec![
            ChatMessage::system("first instruction"),
            ChatMessage::system("second instruction"),
        ];
        history.extend(exchange(1));
        let integrated = integrate_messages(&history, &[ChatMessage::user("hi")], 10);
        let systems: Vec<_> = integrated
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .collect();
        assert_eq!(systems.len(), 1);
        assert!(systems[0].content.contains("first instruction"));
        assert!(systems[0].content.contains("second instruction"));
    }

    #[test]
    fn incoming_system_messages_precede_incoming_user_messages() {
        let incoming = vec![
            ChatMessage::user("question"),
            ChatMessage::system("override"),
        ];
        let integrated = integrate_messages(&[], &incoming, 10);
        assert_eq!(integrated[0].role, MessageRole::System);
        assert_eq!(integrated[1].role, MessageRole::User);
    }

    #[tokio::test]
    async fn store_round_trips_history() {
        let store = HistoryStore::new(JsonStore::new(None));
        let tenant = Uuid::new_v4();
        let agent = Uuid::new_v4();

        let mut history = store.get_or_create(tenant, "sess", agent).await.unwrap();
        assert!(history.messages.is_empty());

        history.append_exchange(ChatMessage::user("q"), ChatMessage::assistant("a"));
        store.save(&history, 3600).await.unwrap();

        let reloaded = store.get_or_create(tenant, "sess", agent).await.unwrap();
        assert_eq!(reloaded.messages.len(), 2);
        assert_eq!(reloaded.conversation_id, history.conversation_id);
    }
}
