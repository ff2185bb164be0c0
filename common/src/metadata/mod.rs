pub mod memory;
pub mod models;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::json;
use uuid::Uuid;

use crate::error::AppError;

pub use memory::InMemoryMetadataStore;
pub use models::{
    AgentIdsOperation, AgentRecord, ConversationRecord, DocumentRecord, MessageRecord,
};

/// Read/write surface of the relational metadata store. Reads run against
/// the public (RLS-scoped) role unless noted; writes and cross-tenant
/// lookups require the service role.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Public lookup: only rows visible to anonymous callers.
    async fn get_public_agent(&self, agent_id: Uuid) -> Result<Option<AgentRecord>, AppError>;

    /// Privileged lookup, bypassing row-level security.
    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<AgentRecord>, AppError>;

    /// Distinct collection ids owned by a tenant (privileged).
    async fn collection_ids(&self, tenant_id: Uuid) -> Result<Vec<String>, AppError>;

    async fn documents_in_collection(
        &self,
        tenant_id: Uuid,
        collection_id: &str,
    ) -> Result<Vec<DocumentRecord>, AppError>;

    async fn insert_document(&self, document: &DocumentRecord) -> Result<(), AppError>;

    async fn delete_document(
        &self,
        tenant_id: Uuid,
        collection_id: &str,
        document_id: Uuid,
    ) -> Result<(), AppError>;

    async fn update_document_agents(
        &self,
        document_id: Uuid,
        agent_ids: &[Uuid],
        operation: AgentIdsOperation,
    ) -> Result<(), AppError>;

    async fn check_resource_limit(&self, tenant_id: Uuid, resource: &str)
        -> Result<bool, AppError>;

    async fn insert_conversation(&self, record: &ConversationRecord) -> Result<(), AppError>;

    async fn insert_messages(&self, records: &[MessageRecord]) -> Result<(), AppError>;

    async fn close_conversation(&self, conversation_id: Uuid) -> Result<(), AppError>;
}

/// PostgREST-speaking client with an anon key for public reads and a
/// service-role key for everything else.
#[derive(Clone)]
pub struct PostgrestStore {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    service_key: String,
}

impl PostgrestStore {
    pub fn new(base_url: &str, anon_key: &str, service_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            service_key: service_key.to_string(),
        }
    }

    fn headers(&self, privileged: bool) -> HeaderMap {
        let key = if privileged {
            &self.service_key
        } else {
            &self.anon_key
        };
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(key) {
            headers.insert("apikey", value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {key}")) {
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, function)
    }

    async fn select<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, String)],
        privileged: bool,
    ) -> Result<Vec<T>, AppError> {
        let response = self
            .http
            .get(self.table_url(table))
            .headers(self.headers(privileged))
            .query(&[("select", "*")])
            .query(filters)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn insert<T: serde::Serialize>(
        &self,
        table: &str,
        rows: &T,
    ) -> Result<(), AppError> {
        let response = self
            .http
            .post(self.table_url(table))
            .headers(self.headers(true))
            .header("Prefer", "return=minimal,resolution=ignore-duplicates")
            .json(rows)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn rpc(
        &self,
        function: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let response = self
            .http
            .post(self.rpc_url(function))
            .headers(self.headers(true))
            .json(&args)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await.unwrap_or(serde_json::Value::Null))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 404 {
        Err(AppError::NotFound(body))
    } else if status.is_server_error() || status.as_u16() == 429 {
        Err(AppError::UpstreamTransient(format!(
            "metadata store {status}: {body}"
        )))
    } else {
        Err(AppError::UpstreamPermanent(format!(
            "metadata store {status}: {body}"
        )))
    }
}

#[async_trait]
impl MetadataStore for PostgrestStore {
    async fn get_public_agent(&self, agent_id: Uuid) -> Result<Option<AgentRecord>, AppError> {
        let rows: Vec<AgentRecord> = self
            .select(
                "agents_with_prompt",
                &[
                    ("agent_id", format!("eq.{agent_id}")),
                    ("is_public", "eq.true".to_string()),
                ],
                false,
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<AgentRecord>, AppError> {
        let rows: Vec<AgentRecord> = self
            .select(
                "agents_with_prompt",
                &[("agent_id", format!("eq.{agent_id}"))],
                true,
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn collection_ids(&self, tenant_id: Uuid) -> Result<Vec<String>, AppError> {
        #[derive(serde::Deserialize)]
        struct Row {
            collection_id: String,
        }
        let response = self
            .http
            .get(self.table_url("documents_rag"))
            .headers(self.headers(true))
            .query(&[
                ("select", "collection_id".to_string()),
                ("tenant_id", format!("eq.{tenant_id}")),
            ])
            .send()
            .await?;
        let response = check_status(response).await?;
        let rows: Vec<Row> = response.json().await?;
        let mut ids: Vec<String> = rows.into_iter().map(|r| r.collection_id).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn documents_in_collection(
        &self,
        tenant_id: Uuid,
        collection_id: &str,
    ) -> Result<Vec<DocumentRecord>, AppError> {
        self.select(
            "documents_rag",
            &[
                ("tenant_id", format!("eq.{tenant_id}")),
                ("collection_id", format!("eq.{collection_id}")),
            ],
            true,
        )
        .await
    }

    async fn insert_document(&self, document: &DocumentRecord) -> Result<(), AppError> {
        self.insert("documents_rag", &vec![document]).await
    }

    async fn delete_document(
        &self,
        tenant_id: Uuid,
        collection_id: &str,
        document_id: Uuid,
    ) -> Result<(), AppError> {
        let response = self
            .http
            .delete(self.table_url("documents_rag"))
            .headers(self.headers(true))
            .query(&[
                ("tenant_id", format!("eq.{tenant_id}")),
                ("collection_id", format!("eq.{collection_id}")),
                ("document_id", format!("eq.{document_id}")),
            ])
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn update_document_agents(
        &self,
        document_id: Uuid,
        agent_ids: &[Uuid],
        operation: AgentIdsOperation,
    ) -> Result<(), AppError> {
        self.rpc(
            "update_document_agents",
            json!({
                "p_document_id": document_id,
                "p_agent_ids": agent_ids,
                "p_operation": operation,
            }),
        )
        .await?;
        Ok(())
    }

    async fn check_resource_limit(
        &self,
        tenant_id: Uuid,
        resource: &str,
    ) -> Result<bool, AppError> {
        let value = self
            .rpc(
                "check_resource_limit",
                json!({"p_tenant_id": tenant_id, "p_resource": resource}),
            )
            .await?;
        Ok(value.as_bool().unwrap_or(true))
    }

    async fn insert_conversation(&self, record: &ConversationRecord) -> Result<(), AppError> {
        self.insert("conversations", &vec![record]).await
    }

    async fn insert_messages(&self, records: &[MessageRecord]) -> Result<(), AppError> {
        self.insert("messages", &records.to_vec()).await
    }

    async fn close_conversation(&self, conversation_id: Uuid) -> Result<(), AppError> {
        let response = self
            .http
            .patch(self.table_url("conversations"))
            .headers(self.headers(true))
            .query(&[("conversation_id", format!("eq.{conversation_id}"))])
            .json(&json!({"closed": true}))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}
