use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, value::Kind, Condition, CreateCollectionBuilder,
    CreateFieldIndexCollectionBuilder, DeletePointsBuilder, Distance, FieldType, Filter, Modifier,
    NamedVectors, PointStruct, Query, QueryPointsBuilder, ScoredPoint, ScrollPointsBuilder,
    SparseVectorParamsBuilder, SparseVectorsConfigBuilder, TextIndexParamsBuilder, TokenizerType,
    UpsertPointsBuilder, Value, Vector, VectorInput, VectorParamsBuilder, VectorsConfigBuilder,
};
use qdrant_client::{Payload, Qdrant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::error::AppError;

use crate::fusion;
use crate::types::{ChunkModel, SearchHit, SearchRequest};

pub const DENSE_VECTOR: &str = "dense";
pub const SPARSE_VECTOR: &str = "bm25";
const PREFETCH_LIMIT: usize = 50;

/// Full-text convenience search targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextField {
    SearchAnchors,
    AtomicFacts,
}

impl TextField {
    fn as_str(&self) -> &'static str {
        match self {
            Self::SearchAnchors => "search_anchors",
            Self::AtomicFacts => "atomic_facts",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpsertOutcome {
    pub stored: usize,
    pub failed_ids: Vec<Uuid>,
}

/// Seam over the vector store so pipeline code tests against an in-memory
/// double.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    async fn ensure_ready(&self) -> Result<(), AppError>;

    /// Idempotent by `chunk_id`; chunks without embeddings are reported in
    /// `failed_ids` and skipped.
    async fn upsert_chunks(&self, chunks: &[ChunkModel]) -> Result<UpsertOutcome, AppError>;

    async fn hybrid_search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, AppError>;

    async fn delete_document(
        &self,
        tenant_id: Uuid,
        collection_id: &str,
        document_id: Uuid,
    ) -> Result<(), AppError>;

    async fn text_search(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        field: TextField,
        text: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, AppError>;
}

/// One shared physical collection; isolation comes from the mandatory
/// tenant and agent filter on every operation.
pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
    dense_size: u64,
    encoder: crate::bm25::Bm25Encoder,
}

impl QdrantIndex {
    pub fn connect(
        url: &str,
        api_key: Option<String>,
        collection: &str,
        dense_size: u64,
    ) -> Result<Self, AppError> {
        let client = Qdrant::from_url(url)
            .api_key(api_key)
            .build()
            .map_err(|err| AppError::Internal(format!("qdrant client: {err}")))?;
        Ok(Self {
            client,
            collection: collection.to_string(),
            dense_size,
            encoder: crate::bm25::Bm25Encoder::default(),
        })
    }

    fn base_filter(&self, tenant_id: Uuid, agent_id: Uuid) -> Vec<Condition> {
        vec![
            Condition::matches("tenant_id", tenant_id.to_string()),
            Condition::matches("agent_ids", agent_id.to_string()),
        ]
    }

    fn search_filter(&self, request: &SearchRequest) -> Filter {
        let mut conditions = self.base_filter(request.tenant_id, request.agent_id);
        if !request.collection_ids.is_empty() {
            conditions.push(Condition::matches(
                "collection_id",
                request.collection_ids.clone(),
            ));
        }
        if !request.document_ids.is_empty() {
            conditions.push(Condition::matches(
                "document_id",
                request
                    .document_ids
                    .iter()
                    .map(Uuid::to_string)
                    .collect::<Vec<_>>(),
            ));
        }
        if let Some(nature) = &request.document_nature {
            conditions.push(Condition::matches("document_nature", nature.clone()));
        }
        Filter::must(conditions)
    }

    async fn ranked_query(
        &self,
        query: Query,
        using: &str,
        filter: Filter,
    ) -> Result<Vec<ScoredPoint>, AppError> {
        let response = self
            .client
            .query(
                QueryPointsBuilder::new(&self.collection)
                    .query(query)
                    .using(using)
                    .filter(filter)
                    .limit(PREFETCH_LIMIT as u64)
                    .with_payload(true),
            )
            .await
            .map_err(map_qdrant_err)?;
        Ok(response.result)
    }
}

#[async_trait]
impl DocumentIndex for QdrantIndex {
    async fn ensure_ready(&self) -> Result<(), AppError> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(map_qdrant_err)?;

        if !exists {
            let mut vectors = VectorsConfigBuilder::default();
            vectors.add_named_vector_params(
                DENSE_VECTOR,
                VectorParamsBuilder::new(self.dense_size, Distance::Cosine),
            );
            let mut sparse = SparseVectorsConfigBuilder::default();
            sparse.add_named_vector_params(
                SPARSE_VECTOR,
                SparseVectorParamsBuilder::default().modifier(Modifier::Idf),
            );
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection)
                        .vectors_config(vectors)
                        .sparse_vectors_config(sparse)
                        .on_disk_payload(true),
                )
                .await
                .map_err(map_qdrant_err)?;
            info!(collection = %self.collection, "created vector collection");
        }

        for field in [
            "tenant_id",
            "collection_id",
            "agent_ids",
            "document_id",
            "document_nature",
        ] {
            let result = self
                .client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    &self.collection,
                    field,
                    FieldType::Keyword,
                ))
                .await;
            if let Err(err) = result {
                debug!(field, error = %err, "keyword index may already exist");
            }
        }

        let float_index = self
            .client
            .create_field_index(CreateFieldIndexCollectionBuilder::new(
                &self.collection,
                "fact_density",
                FieldType::Float,
            ))
            .await;
        if let Err(err) = float_index {
            debug!(error = %err, "fact_density index may already exist");
        }

        for field in ["content", "search_anchors", "atomic_facts"] {
            let params = TextIndexParamsBuilder::new(TokenizerType::Multilingual)
                .min_token_len(2)
                .max_token_len(30)
                .lowercase(true);
            let result = self
                .client
                .create_field_index(
                    CreateFieldIndexCollectionBuilder::new(
                        &self.collection,
                        field,
                        FieldType::Text,
                    )
                    .field_index_params(params.build()),
                )
                .await;
            if let Err(err) = result {
                debug!(field, error = %err, "text index may already exist");
            }
        }

        Ok(())
    }

    async fn upsert_chunks(&self, chunks: &[ChunkModel]) -> Result<UpsertOutcome, AppError> {
        let mut outcome = UpsertOutcome::default();
        let mut points = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let Some(embedding) = chunk.embedding.clone() else {
                warn!(chunk_id = %chunk.chunk_id, "chunk without embedding skipped");
                outcome.failed_ids.push(chunk.chunk_id);
                continue;
            };

            let sparse = self.encoder.encode(&chunk.bm25_text());
            let vectors = NamedVectors::default()
                .add_vector(DENSE_VECTOR, Vector::new_dense(embedding))
                .add_vector(
                    SPARSE_VECTOR,
                    Vector::new_sparse(sparse.indices, sparse.values),
                );

            let payload = Payload::try_from(chunk.payload())
                .map_err(|err| AppError::Internal(format!("chunk payload: {err}")))?;
            points.push(PointStruct::new(
                chunk.chunk_id.to_string(),
                vectors,
                payload,
            ));
        }

        if points.is_empty() {
            return Ok(outcome);
        }

        let stored = points.len();
        let result = self
            .client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await;

        match result {
            Ok(_) => {
                outcome.stored = stored;
                Ok(outcome)
            }
            Err(err) => {
                // The whole batch is reported failed; the owning task state
                // machine decides whether to retry.
                warn!(error = %err, "vector upsert failed");
                outcome.failed_ids.extend(
                    chunks
                        .iter()
                        .filter(|c| c.embedding.is_some())
                        .map(|c| c.chunk_id),
                );
                Ok(outcome)
            }
        }
    }

    async fn hybrid_search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, AppError> {
        let filter = self.search_filter(request);

        let dense_query = Query::new_nearest(request.dense.clone());
        let sparse_query = Query::new_nearest(VectorInput::new_sparse(
            request.sparse.indices.clone(),
            request.sparse.values.clone(),
        ));

        let (dense_points, sparse_points) = tokio::join!(
            self.ranked_query(dense_query, DENSE_VECTOR, filter.clone()),
            self.ranked_query(sparse_query, SPARSE_VECTOR, filter),
        );
        let dense_points = dense_points?;
        let sparse_points = if request.sparse.is_empty() {
            Vec::new()
        } else {
            sparse_points?
        };

        let mut payloads: HashMap<Uuid, &ScoredPoint> = HashMap::new();
        let dense_ids: Vec<Uuid> = dense_points
            .iter()
            .filter_map(|p| {
                let id = point_uuid(p)?;
                payloads.entry(id).or_insert(p);
                Some(id)
            })
            .collect();
        let sparse_ids: Vec<Uuid> = sparse_points
            .iter()
            .filter_map(|p| {
                let id = point_uuid(p)?;
                payloads.entry(id).or_insert(p);
                Some(id)
            })
            .collect();

        let mut fused = fusion::reciprocal_rank_fusion(&dense_ids, &sparse_ids, request.rrf_k);
        for hit in &mut fused {
            let density = payloads
                .get(&hit.id)
                .and_then(|p| payload_f32(p, "fact_density"));
            hit.score = fusion::boosted_score(hit.score, request.fact_density_boost, density);
        }
        fusion::resort(&mut fused);

        let hits = fused
            .into_iter()
            .filter(|hit| hit.score >= request.similarity_threshold)
            .take(request.top_k)
            .filter_map(|hit| {
                let point = payloads.get(&hit.id)?;
                Some(hydrate_hit(hit.id, hit.score, point))
            })
            .collect();
        Ok(hits)
    }

    async fn delete_document(
        &self,
        tenant_id: Uuid,
        collection_id: &str,
        document_id: Uuid,
    ) -> Result<(), AppError> {
        let filter = Filter::must([
            Condition::matches("tenant_id", tenant_id.to_string()),
            Condition::matches("collection_id", collection_id.to_string()),
            Condition::matches("document_id", document_id.to_string()),
        ]);
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(filter)
                    .wait(true),
            )
            .await
            .map_err(map_qdrant_err)?;
        Ok(())
    }

    async fn text_search(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        field: TextField,
        text: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, AppError> {
        let mut conditions = self.base_filter(tenant_id, agent_id);
        conditions.push(Condition::matches_text(field.as_str(), text));

        let response = self
            .client
            .scroll(
                ScrollPointsBuilder::new(&self.collection)
                    .filter(Filter::must(conditions))
                    .limit(limit as u32)
                    .with_payload(true),
            )
            .await
            .map_err(map_qdrant_err)?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                let id = retrieved_uuid(&point.id)?;
                Some(SearchHit {
                    chunk_id: id,
                    document_id: payload_uuid_map(&point.payload, "document_id"),
                    collection_id: payload_str_map(&point.payload, "collection_id")
                        .unwrap_or_default(),
                    content: payload_str_map(&point.payload, "content").unwrap_or_default(),
                    score: 0.0,
                    fact_density: payload_f32_map(&point.payload, "fact_density").unwrap_or(0.5),
                })
            })
            .collect())
    }
}

fn map_qdrant_err(err: qdrant_client::QdrantError) -> AppError {
    AppError::UpstreamTransient(format!("vector store: {err}"))
}

fn point_uuid(point: &ScoredPoint) -> Option<Uuid> {
    retrieved_uuid(&point.id)
}

fn retrieved_uuid(id: &Option<qdrant_client::qdrant::PointId>) -> Option<Uuid> {
    match id.as_ref()?.point_id_options.as_ref()? {
        PointIdOptions::Uuid(value) => Uuid::parse_str(value).ok(),
        PointIdOptions::Num(_) => None,
    }
}

fn payload_str_map(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
    match payload.get(key)?.kind.as_ref()? {
        Kind::StringValue(s) => Some(s.clone()),
        _ => None,
    }
}

fn payload_uuid_map(payload: &HashMap<String, Value>, key: &str) -> Option<Uuid> {
    payload_str_map(payload, key).and_then(|s| Uuid::parse_str(&s).ok())
}

fn payload_f32_map(payload: &HashMap<String, Value>, key: &str) -> Option<f32> {
    match payload.get(key)?.kind.as_ref()? {
        Kind::DoubleValue(v) => Some(*v as f32),
        Kind::IntegerValue(v) => Some(*v as f32),
        _ => None,
    }
}

fn payload_f32(point: &ScoredPoint, key: &str) -> Option<f32> {
    payload_f32_map(&point.payload, key)
}

fn hydrate_hit(id: Uuid, score: f32, point: &ScoredPoint) -> SearchHit {
    SearchHit {
        chunk_id: id,
        document_id: payload_uuid_map(&point.payload, "document_id"),
        collection_id: payload_str_map(&point.payload, "collection_id").unwrap_or_default(),
        content: payload_str_map(&point.payload, "content").unwrap_or_default(),
        score,
        fact_density: payload_f32(point, "fact_density").unwrap_or(0.5),
    }
}
