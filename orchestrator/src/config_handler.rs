use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use common::cache::{keys, RedisCache};
use common::error::AppError;
use common::metadata::MetadataStore;
use common::model::{ExecutionConfig, QueryConfig, RagConfig, NO_DOCUMENTS_SENTINEL};

/// Agent configuration after resolution, with `collection_ids` rewritten to
/// the tenant's real collection set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedAgent {
    pub agent_id: Uuid,
    pub tenant_id: Uuid,
    pub agent_name: String,
    pub execution_config: ExecutionConfig,
    pub query_config: QueryConfig,
    pub rag_config: RagConfig,
}

#[async_trait]
pub trait AgentLookup: Send + Sync {
    async fn agent_configs(&self, agent_id: Uuid) -> Result<ResolvedAgent, AppError>;

    async fn invalidate(&self, agent_id: Uuid);
}

/// Two-level read-through cache in front of the metadata store: a process
/// map with TTL stamps, then Redis, then the store (public-first).
pub struct ConfigHandler {
    process_cache: RwLock<HashMap<Uuid, (ResolvedAgent, Instant)>>,
    redis_cache: Option<RedisCache>,
    store: Arc<dyn MetadataStore>,
    ttl: Duration,
}

impl ConfigHandler {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        redis_cache: Option<RedisCache>,
        ttl: Duration,
    ) -> Self {
        Self {
            process_cache: RwLock::new(HashMap::new()),
            redis_cache,
            store,
            ttl,
        }
    }

    async fn resolve_from_store(&self, agent_id: Uuid) -> Result<ResolvedAgent, AppError> {
        let record = match self.store.get_public_agent(agent_id).await? {
            Some(record) => record,
            None => self
                .store
                .get_agent(agent_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("agent {agent_id} not found")))?,
        };

        let mut rag_config = record.rag_config;
        let real_collections = self.store.collection_ids(record.tenant_id).await?;
        if real_collections.is_empty() {
            debug!(%agent_id, tenant_id = %record.tenant_id, "tenant has no documents; retrieval disabled");
            rag_config.collection_ids = vec![NO_DOCUMENTS_SENTINEL.to_string()];
        } else {
            rag_config.collection_ids = real_collections;
        }

        Ok(ResolvedAgent {
            agent_id: record.agent_id,
            tenant_id: record.tenant_id,
            agent_name: record.agent_name,
            execution_config: record.execution_config,
            query_config: record.query_config,
            rag_config,
        })
    }
}

#[async_trait]
impl AgentLookup for ConfigHandler {
    async fn agent_configs(&self, agent_id: Uuid) -> Result<ResolvedAgent, AppError> {
        if let Some((resolved, stamp)) = self.process_cache.read().await.get(&agent_id) {
            if stamp.elapsed() < self.ttl {
                return Ok(resolved.clone());
            }
        }

        if let Some(cache) = &self.redis_cache {
            if let Some(resolved) = cache
                .get::<ResolvedAgent>(&keys::agent_config(&agent_id))
                .await?
            {
                self.process_cache
                    .write()
                    .await
                    .insert(agent_id, (resolved.clone(), Instant::now()));
                return Ok(resolved);
            }
        }

        let resolved = self.resolve_from_store(agent_id).await?;
        if let Some(cache) = &self.redis_cache {
            cache
                .set(
                    &keys::agent_config(&agent_id),
                    &resolved,
                    self.ttl.as_secs().max(1),
                )
                .await
                .ok();
        }
        self.process_cache
            .write()
            .await
            .insert(agent_id, (resolved.clone(), Instant::now()));
        info!(%agent_id, tenant_id = %resolved.tenant_id, "agent configs resolved from store");
        Ok(resolved)
    }

    async fn invalidate(&self, agent_id: Uuid) {
        self.process_cache.write().await.remove(&agent_id);
        if let Some(cache) = &self.redis_cache {
            cache.delete(&keys::agent_config(&agent_id)).await.ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::metadata::{AgentRecord, DocumentRecord, InMemoryMetadataStore};
    use std::sync::atomic::Ordering;

    fn document(tenant_id: Uuid, collection_id: &str) -> DocumentRecord {
        DocumentRecord {
            document_id: Uuid::new_v4(),
            tenant_id,
            collection_id: collection_id.to_string(),
            document_name: "doc.md".into(),
            document_type: "md".into(),
            embedding_model: "text-embedding-3-small".into(),
            embedding_dimensions: 1536,
            chunk_size: 512,
            chunk_overlap: 50,
            status: "completed".into(),
            total_chunks: 1,
            processed_chunks: 1,
            agent_ids: vec![],
            metadata: None,
            created_at: Utc::now(),
        }
    }

    fn agent_record(collections: &[&str]) -> (InMemoryMetadataStore, Uuid) {
        let agent_id = Uuid::new_v4();
        let tenant_id = Uuid::new_v4();
        let record = AgentRecord {
            agent_id,
            tenant_id,
            agent_name: "support-bot".into(),
            is_public: true,
            execution_config: ExecutionConfig::default(),
            query_config: QueryConfig {
                model: "llama-3.3-70b-versatile".into(),
                system_prompt_template: "You are helpful.".into(),
                temperature: 0.5,
                max_tokens: 256,
                top_p: 1.0,
                frequency_penalty: 0.0,
                presence_penalty: 0.0,
                stop: None,
                timeout_secs: None,
                max_retries: None,
            },
            rag_config: RagConfig {
                collection_ids: vec!["stale-default".into()],
                document_ids: vec![],
                top_k: 5,
                similarity_threshold: 0.0,
                embedding_model: "text-embedding-3-small".into(),
                embedding_dimensions: 1536,
                fact_density_boost: 0.0,
                max_text_length: 8192,
                max_retries: 3,
            },
        };
        let store = InMemoryMetadataStore::new().with_agent(record);
        for collection in collections {
            store.push_document(document(tenant_id, collection));
        }
        (store, agent_id)
    }

    #[tokio::test]
    async fn rewrites_collection_ids_to_real_set() {
        let (store, agent_id) = agent_record(&["col_a", "col_b"]);
        let handler = ConfigHandler::new(Arc::new(store), None, Duration::from_secs(60));
        let resolved = handler.agent_configs(agent_id).await.unwrap();
        assert_eq!(resolved.rag_config.collection_ids, vec!["col_a", "col_b"]);
    }

    #[tokio::test]
    async fn empty_tenant_gets_sentinel() {
        let (store, agent_id) = agent_record(&[]);
        let handler = ConfigHandler::new(Arc::new(store), None, Duration::from_secs(60));
        let resolved = handler.agent_configs(agent_id).await.unwrap();
        assert!(resolved.rag_config.retrieval_disabled());
    }

    #[tokio::test]
    async fn second_lookup_within_ttl_hits_process_cache() {
        let (store, agent_id) = agent_record(&["col_a"]);
        let store = Arc::new(store);
        let handler = ConfigHandler::new(store.clone(), None, Duration::from_secs(60));

        let first = handler.agent_configs(agent_id).await.unwrap();
        let second = handler.agent_configs(agent_id).await.unwrap();
        assert_eq!(first.rag_config, second.rag_config);
        assert_eq!(store.agent_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_store_read() {
        let (store, agent_id) = agent_record(&["col_a"]);
        let store = Arc::new(store);
        let handler = ConfigHandler::new(store.clone(), None, Duration::from_secs(60));

        handler.agent_configs(agent_id).await.unwrap();
        handler.invalidate(agent_id).await;
        handler.agent_configs(agent_id).await.unwrap();
        assert_eq!(store.agent_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_agent_is_not_found() {
        let (store, _agent_id) = agent_record(&[]);
        let handler = ConfigHandler::new(Arc::new(store), None, Duration::from_secs(60));
        assert!(matches!(
            handler.agent_configs(Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }
}
