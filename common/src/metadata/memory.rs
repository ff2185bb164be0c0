use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppError;
use crate::metadata::{
    AgentIdsOperation, AgentRecord, ConversationRecord, DocumentRecord, MessageRecord,
    MetadataStore,
};

/// Process-local metadata store for tests and broker-less dry runs. Same
/// visibility rules as the real store: public lookups only see public
/// agents, duplicate document inserts are swallowed.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    pub agents: Mutex<Vec<AgentRecord>>,
    pub documents: Mutex<Vec<DocumentRecord>>,
    pub conversations: Mutex<Vec<ConversationRecord>>,
    pub messages: Mutex<Vec<MessageRecord>>,
    /// Counts store-level agent lookups, for cache assertions.
    pub agent_reads: AtomicUsize,
    pub limit_ok: std::sync::atomic::AtomicBool,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        let store = Self::default();
        store.limit_ok.store(true, Ordering::SeqCst);
        store
    }

    pub fn with_agent(self, agent: AgentRecord) -> Self {
        self.agents.lock().expect("store poisoned").push(agent);
        self
    }

    pub fn push_document(&self, document: DocumentRecord) {
        self.documents
            .lock()
            .expect("store poisoned")
            .push(document);
    }

    pub fn document_count(&self) -> usize {
        self.documents.lock().expect("store poisoned").len()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().expect("store poisoned").len()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get_public_agent(&self, agent_id: Uuid) -> Result<Option<AgentRecord>, AppError> {
        self.agent_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .agents
            .lock()
            .expect("store poisoned")
            .iter()
            .find(|a| a.agent_id == agent_id && a.is_public)
            .cloned())
    }

    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<AgentRecord>, AppError> {
        self.agent_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .agents
            .lock()
            .expect("store poisoned")
            .iter()
            .find(|a| a.agent_id == agent_id)
            .cloned())
    }

    async fn collection_ids(&self, tenant_id: Uuid) -> Result<Vec<String>, AppError> {
        let mut ids: Vec<String> = self
            .documents
            .lock()
            .expect("store poisoned")
            .iter()
            .filter(|d| d.tenant_id == tenant_id)
            .map(|d| d.collection_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn documents_in_collection(
        &self,
        tenant_id: Uuid,
        collection_id: &str,
    ) -> Result<Vec<DocumentRecord>, AppError> {
        Ok(self
            .documents
            .lock()
            .expect("store poisoned")
            .iter()
            .filter(|d| d.tenant_id == tenant_id && d.collection_id == collection_id)
            .cloned()
            .collect())
    }

    async fn insert_document(&self, document: &DocumentRecord) -> Result<(), AppError> {
        let mut documents = self.documents.lock().expect("store poisoned");
        if documents
            .iter()
            .any(|d| d.document_id == document.document_id)
        {
            return Ok(());
        }
        documents.push(document.clone());
        Ok(())
    }

    async fn delete_document(
        &self,
        tenant_id: Uuid,
        collection_id: &str,
        document_id: Uuid,
    ) -> Result<(), AppError> {
        self.documents.lock().expect("store poisoned").retain(|d| {
            !(d.tenant_id == tenant_id
                && d.collection_id == collection_id
                && d.document_id == document_id)
        });
        Ok(())
    }

    async fn update_document_agents(
        &self,
        document_id: Uuid,
        agent_ids: &[Uuid],
        operation: AgentIdsOperation,
    ) -> Result<(), AppError> {
        let mut documents = self.documents.lock().expect("store poisoned");
        let document = documents
            .iter_mut()
            .find(|d| d.document_id == document_id)
            .ok_or_else(|| AppError::NotFound(format!("document {document_id} not found")))?;
        match operation {
            AgentIdsOperation::Set => document.agent_ids = agent_ids.to_vec(),
            AgentIdsOperation::Add => {
                for id in agent_ids {
                    if !document.agent_ids.contains(id) {
                        document.agent_ids.push(*id);
                    }
                }
            }
            AgentIdsOperation::Remove => {
                document.agent_ids.retain(|id| !agent_ids.contains(id));
            }
        }
        Ok(())
    }

    async fn check_resource_limit(
        &self,
        _tenant_id: Uuid,
        _resource: &str,
    ) -> Result<bool, AppError> {
        Ok(self.limit_ok.load(Ordering::SeqCst))
    }

    async fn insert_conversation(&self, record: &ConversationRecord) -> Result<(), AppError> {
        let mut conversations = self.conversations.lock().expect("store poisoned");
        if !conversations
            .iter()
            .any(|c| c.conversation_id == record.conversation_id)
        {
            conversations.push(record.clone());
        }
        Ok(())
    }

    async fn insert_messages(&self, records: &[MessageRecord]) -> Result<(), AppError> {
        self.messages
            .lock()
            .expect("store poisoned")
            .extend(records.iter().cloned());
        Ok(())
    }

    async fn close_conversation(&self, conversation_id: Uuid) -> Result<(), AppError> {
        let mut conversations = self.conversations.lock().expect("store poisoned");
        if let Some(conversation) = conversations
            .iter_mut()
            .find(|c| c.conversation_id == conversation_id)
        {
            conversation.closed = true;
        }
        Ok(())
    }
}
