use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// The unit indexed in the vector store. `content` is the context-prefixed
/// text used for dense embedding; `content_raw` is the bare sub-chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkModel {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub tenant_id: Uuid,
    pub collection_id: String,
    pub agent_ids: Vec<Uuid>,
    pub chunk_index: usize,

    pub content: String,
    pub content_raw: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_level: Option<u8>,
    pub section_context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_title: Option<String>,

    #[serde(default)]
    pub entities: Vec<EntityRef>,
    #[serde(default)]
    pub noun_chunks: Vec<String>,

    #[serde(default)]
    pub search_anchors: Vec<String>,
    #[serde(default)]
    pub atomic_facts: Vec<String>,
    #[serde(default = "default_fact_density")]
    pub fact_density: f32,
    #[serde(default)]
    pub normalized_entities: HashMap<String, Vec<String>>,

    pub document_name: String,
    pub document_type: String,
    pub document_nature: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    pub has_tables: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

fn default_fact_density() -> f32 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityRef {
    pub text: String,
    pub label: String,
}

impl ChunkModel {
    /// Text the sparse vector is built over. Hierarchical composition with
    /// repetition boosts: section context x3, noun chunks x3, entities x2,
    /// search anchors x3, atomic facts x2, raw content x1. Pure in the chunk
    /// fields.
    pub fn bm25_text(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        if !self.section_context.is_empty() {
            for _ in 0..3 {
                parts.push(self.section_context.clone());
            }
        }
        if !self.noun_chunks.is_empty() {
            let joined = self.noun_chunks.join(" ");
            for _ in 0..3 {
                parts.push(joined.clone());
            }
        }
        if !self.entities.is_empty() {
            let joined = self
                .entities
                .iter()
                .map(|e| e.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            for _ in 0..2 {
                parts.push(joined.clone());
            }
        }
        if !self.search_anchors.is_empty() {
            let joined = self.search_anchors.join(" ");
            for _ in 0..3 {
                parts.push(joined.clone());
            }
        }
        if !self.atomic_facts.is_empty() {
            let joined = self.atomic_facts.join(" ");
            for _ in 0..2 {
                parts.push(joined.clone());
            }
        }
        if !self.content_raw.is_empty() {
            parts.push(self.content_raw.clone());
        }

        parts.join("\n")
    }

    /// Payload stored alongside the vectors; every indexed field plus
    /// structural metadata.
    pub fn payload(&self) -> serde_json::Value {
        json!({
            "tenant_id": self.tenant_id,
            "collection_id": self.collection_id,
            "agent_ids": self.agent_ids,
            "document_id": self.document_id,
            "chunk_id": self.chunk_id,
            "content": self.content,
            "content_raw": self.content_raw,
            "chunk_index": self.chunk_index,
            "search_anchors": self.search_anchors,
            "atomic_facts": self.atomic_facts,
            "fact_density": self.fact_density,
            "document_nature": self.document_nature,
            "normalized_entities": self.normalized_entities,
            "document_type": self.document_type,
            "document_name": self.document_name,
            "language": self.language,
            "page_count": self.page_count,
            "has_tables": self.has_tables,
            "section_title": self.section_title,
            "section_context": self.section_context,
            "created_at": self.created_at.to_rfc3339(),
        })
    }
}

/// Mandatory-filter hybrid search request. Isolation is enforced by the
/// tenant and agent conditions on every query.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub tenant_id: Uuid,
    pub agent_id: Uuid,
    pub collection_ids: Vec<String>,
    pub document_ids: Vec<Uuid>,
    pub document_nature: Option<String>,
    pub dense: Vec<f32>,
    pub sparse: crate::bm25::SparseIndexVector,
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub fact_density_boost: f32,
    pub rrf_k: u32,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: Uuid,
    pub document_id: Option<Uuid>,
    pub collection_id: String,
    pub content: String,
    pub score: f32,
    pub fact_density: f32,
}

/// Canonical fixture for index tests.
#[cfg(any(test, feature = "test-utils"))]
pub fn sample_chunk(tenant_id: Uuid, collection_id: &str) -> ChunkModel {
    ChunkModel {
        chunk_id: Uuid::new_v4(),
        document_id: Uuid::new_v4(),
        tenant_id,
        collection_id: collection_id.to_string(),
        agent_ids: vec![Uuid::new_v4()],
        chunk_index: 0,
        content: "In document 'doc', section 'Intro': body text".into(),
        content_raw: "body text".into(),
        section_title: Some("Intro".into()),
        section_level: Some(2),
        section_context: "In document 'doc', section 'Intro':".into(),
        parent_title: None,
        entities: vec![EntityRef {
            text: "Acme".into(),
            label: "ORG".into(),
        }],
        noun_chunks: vec!["body text".into()],
        search_anchors: vec![],
        atomic_facts: vec![],
        fact_density: 0.5,
        normalized_entities: HashMap::new(),
        document_name: "doc".into(),
        document_type: "md".into(),
        document_nature: "technical".into(),
        language: "en".into(),
        page_count: None,
        has_tables: false,
        embedding: Some(vec![0.1, 0.2, 0.3]),
        created_at: Utc::now(),
    }
}
