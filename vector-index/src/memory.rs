use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use common::error::AppError;

use crate::bm25::SparseIndexVector;
use crate::client::{DocumentIndex, TextField, UpsertOutcome};
use crate::fusion;
use crate::types::{ChunkModel, SearchHit, SearchRequest};

/// Process-local stand-in for the vector store, used by pipeline tests and
/// local development without a running cluster. Same filtering and fusion
/// semantics, cosine similarity over whatever dimension the chunks carry.
#[derive(Default)]
pub struct InMemoryIndex {
    points: Mutex<HashMap<Uuid, StoredPoint>>,
}

struct StoredPoint {
    chunk: ChunkModel,
    sparse: SparseIndexVector,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.lock().expect("index poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, chunk_id: &Uuid) -> bool {
        self.points
            .lock()
            .expect("index poisoned")
            .contains_key(chunk_id)
    }

    pub fn get(&self, chunk_id: &Uuid) -> Option<ChunkModel> {
        self.points
            .lock()
            .expect("index poisoned")
            .get(chunk_id)
            .map(|p| p.chunk.clone())
    }

    fn matches_filter(chunk: &ChunkModel, request: &SearchRequest) -> bool {
        chunk.tenant_id == request.tenant_id
            && chunk.agent_ids.contains(&request.agent_id)
            && (request.collection_ids.is_empty()
                || request.collection_ids.contains(&chunk.collection_id))
            && (request.document_ids.is_empty()
                || request.document_ids.contains(&chunk.document_id))
            && request
                .document_nature
                .as_ref()
                .is_none_or(|nature| *nature == chunk.document_nature)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn sparse_dot(a: &SparseIndexVector, b: &SparseIndexVector) -> f32 {
    let lookup: HashMap<u32, f32> = a
        .indices
        .iter()
        .copied()
        .zip(a.values.iter().copied())
        .collect();
    b.indices
        .iter()
        .zip(&b.values)
        .filter_map(|(idx, value)| lookup.get(idx).map(|other| other * value))
        .sum()
}

#[async_trait]
impl DocumentIndex for InMemoryIndex {
    async fn ensure_ready(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn upsert_chunks(&self, chunks: &[ChunkModel]) -> Result<UpsertOutcome, AppError> {
        let encoder = crate::bm25::Bm25Encoder::default();
        let mut outcome = UpsertOutcome::default();
        let mut points = self.points.lock().expect("index poisoned");
        for chunk in chunks {
            if chunk.embedding.is_none() {
                outcome.failed_ids.push(chunk.chunk_id);
                continue;
            }
            let sparse = encoder.encode(&chunk.bm25_text());
            points.insert(
                chunk.chunk_id,
                StoredPoint {
                    chunk: chunk.clone(),
                    sparse,
                },
            );
            outcome.stored += 1;
        }
        Ok(outcome)
    }

    async fn hybrid_search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, AppError> {
        let points = self.points.lock().expect("index poisoned");
        let mut dense_scored: Vec<(Uuid, f32)> = Vec::new();
        let mut sparse_scored: Vec<(Uuid, f32)> = Vec::new();

        for (id, point) in points.iter() {
            if !Self::matches_filter(&point.chunk, request) {
                continue;
            }
            if let Some(embedding) = &point.chunk.embedding {
                dense_scored.push((*id, cosine(embedding, &request.dense)));
            }
            if !request.sparse.is_empty() {
                let overlap = sparse_dot(&point.sparse, &request.sparse);
                if overlap > 0.0 {
                    sparse_scored.push((*id, overlap));
                }
            }
        }

        dense_scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        sparse_scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let dense_ids: Vec<Uuid> = dense_scored.iter().map(|(id, _)| *id).collect();
        let sparse_ids: Vec<Uuid> = sparse_scored.iter().map(|(id, _)| *id).collect();

        let mut fused = fusion::reciprocal_rank_fusion(&dense_ids, &sparse_ids, request.rrf_k);
        for hit in &mut fused {
            let density = points.get(&hit.id).map(|p| p.chunk.fact_density);
            hit.score = fusion::boosted_score(hit.score, request.fact_density_boost, density);
        }
        fusion::resort(&mut fused);

        Ok(fused
            .into_iter()
            .filter(|hit| hit.score >= request.similarity_threshold)
            .take(request.top_k)
            .filter_map(|hit| {
                let point = points.get(&hit.id)?;
                Some(SearchHit {
                    chunk_id: hit.id,
                    document_id: Some(point.chunk.document_id),
                    collection_id: point.chunk.collection_id.clone(),
                    content: point.chunk.content.clone(),
                    score: hit.score,
                    fact_density: point.chunk.fact_density,
                })
            })
            .collect())
    }

    async fn delete_document(
        &self,
        tenant_id: Uuid,
        collection_id: &str,
        document_id: Uuid,
    ) -> Result<(), AppError> {
        let mut points = self.points.lock().expect("index poisoned");
        points.retain(|_, point| {
            !(point.chunk.tenant_id == tenant_id
                && point.chunk.collection_id == collection_id
                && point.chunk.document_id == document_id)
        });
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
        let needle = text.to_lowercase();
        let points = self.points.lock().expect("index poisoned");
        Ok(points
            .values()
            .filter(|point| {
                point.chunk.tenant_id == tenant_id && point.chunk.agent_ids.contains(&agent_id)
            })
            .filter(|point| {
                let haystack = match field {
                    TextField::SearchAnchors => point.chunk.search_anchors.join(" "),
                    TextField::AtomicFacts => point.chunk.atomic_facts.join(" "),
                };
                haystack.to_lowercase().contains(&needle)
            })
            .take(limit)
            .map(|point| SearchHit {
                chunk_id: point.chunk.chunk_id,
                document_id: Some(point.chunk.document_id),
                collection_id: point.chunk.collection_id.clone(),
                content: point.chunk.content.clone(),
                score: 0.0,
                fact_density: point.chunk.fact_density,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bm25::Bm25Encoder;
    use crate::types::sample_chunk;

    fn request_for(chunk: &ChunkModel, query: &str) -> SearchRequest {
        SearchRequest {
            tenant_id: chunk.tenant_id,
            agent_id: chunk.agent_ids[0],
            collection_ids: vec![chunk.collection_id.clone()],
            document_ids: vec![],
            document_nature: None,
            dense: chunk.embedding.clone().unwrap(),
            sparse: Bm25Encoder::default().encode(query),
            top_k: 5,
            similarity_threshold: 0.0,
            fact_density_boost: 0.0,
            rrf_k: 60,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_chunk_id() {
        let index = InMemoryIndex::new();
        let chunk = sample_chunk(Uuid::new_v4(), "col");
        index.upsert_chunks(&[chunk.clone()]).await.unwrap();
        index.upsert_chunks(&[chunk.clone()]).await.unwrap();
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn chunks_without_embeddings_are_reported_failed() {
        let index = InMemoryIndex::new();
        let mut chunk = sample_chunk(Uuid::new_v4(), "col");
        chunk.embedding = None;
        let outcome = index.upsert_chunks(&[chunk.clone()]).await.unwrap();
        assert_eq!(outcome.stored, 0);
        assert_eq!(outcome.failed_ids, vec![chunk.chunk_id]);
    }

    #[tokio::test]
    async fn search_enforces_tenant_isolation() {
        let index = InMemoryIndex::new();
        let chunk = sample_chunk(Uuid::new_v4(), "col");
        index.upsert_chunks(&[chunk.clone()]).await.unwrap();

        let hits = index.hybrid_search(&request_for(&chunk, "body text")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, chunk.chunk_id);

        let mut foreign = request_for(&chunk, "body text");
        foreign.tenant_id = Uuid::new_v4();
        assert!(index.hybrid_search(&foreign).await.unwrap().is_empty());

        let mut wrong_agent = request_for(&chunk, "body text");
        wrong_agent.agent_id = Uuid::new_v4();
        assert!(index.hybrid_search(&wrong_agent).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_document_removes_only_that_document() {
        let index = InMemoryIndex::new();
        let tenant = Uuid::new_v4();
        let kept = sample_chunk(tenant, "col");
        let dropped = sample_chunk(tenant, "col");
        index
            .upsert_chunks(&[kept.clone(), dropped.clone()])
            .await
            .unwrap();

        index
            .delete_document(tenant, "col", dropped.document_id)
            .await
            .unwrap();
        assert!(index.contains(&kept.chunk_id));
        assert!(!index.contains(&dropped.chunk_id));
    }

    #[tokio::test]
    async fn fact_density_boost_reorders_equally_ranked_hits() {
        let index = InMemoryIndex::new();
        let tenant = Uuid::new_v4();
        let agent = Uuid::new_v4();

        let mut low = sample_chunk(tenant, "col");
        low.agent_ids = vec![agent];
        low.fact_density = 0.1;
        low.embedding = Some(vec![1.0, 0.0, 0.0]);

        let mut high = sample_chunk(tenant, "col");
        high.agent_ids = vec![agent];
        high.fact_density = 0.9;
        high.embedding = Some(vec![0.99, 0.1, 0.0]);
        high.content_raw = "unrelated words entirely".into();
        high.content = "unrelated words entirely".into();

        index.upsert_chunks(&[low.clone(), high.clone()]).await.unwrap();

        let request = SearchRequest {
            tenant_id: tenant,
            agent_id: agent,
            collection_ids: vec!["col".into()],
            document_ids: vec![],
            document_nature: None,
            dense: vec![1.0, 0.0, 0.0],
            sparse: SparseIndexVector::default(),
            top_k: 2,
            similarity_threshold: 0.0,
            fact_density_boost: 5.0,
            rrf_k: 60,
        };
        let hits = index.hybrid_search(&request).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, high.chunk_id, "boost outweighs rank gap");
    }
}
