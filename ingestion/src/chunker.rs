use std::collections::HashMap;

use chrono::Utc;
use text_splitter::{ChunkConfig, TextSplitter};
use tracing::debug;
use uuid::Uuid;

use common::error::AppError;
use common::model::{DocumentType, NlpEnrichment, SectionInfo};
use vector_index::types::EntityRef;
use vector_index::ChunkModel;

const MIN_SECTION_CHARS: usize = 50;

/// Everything the chunker needs about the document being split.
pub struct ChunkerInput<'a> {
    pub text: &'a str,
    pub sections: &'a [SectionInfo],
    pub enrichment: &'a NlpEnrichment,
    pub document_id: Uuid,
    pub tenant_id: Uuid,
    pub collection_id: &'a str,
    pub agent_ids: &'a [Uuid],
    pub document_name: &'a str,
    pub document_type: DocumentType,
    pub page_count: Option<u32>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

/// Splits a document into sentence-aware sub-chunks that carry their
/// section context, so each indexed unit stays interpretable on its own.
pub fn chunk_document(input: &ChunkerInput<'_>) -> Result<Vec<ChunkModel>, AppError> {
    let splitter = build_splitter(input.chunk_size, input.chunk_overlap)?;
    let chars: Vec<char> = input.text.chars().collect();

    let mut chunks = Vec::new();
    if input.sections.is_empty() {
        let base_context = format!("In document '{}':", input.document_name);
        append_chunks(
            &mut chunks,
            input,
            &splitter,
            input.text,
            &base_context,
            None,
            None,
            None,
        );
    } else {
        for (i, section) in input.sections.iter().enumerate() {
            let start = section.start_char.min(chars.len());
            let end = section
                .end_char
                .or_else(|| input.sections.get(i + 1).map(|next| next.start_char))
                .unwrap_or(chars.len())
                .min(chars.len());
            if end <= start {
                continue;
            }
            let content: String = chars[start..end].iter().collect();
            let content = content.trim();
            if content.chars().count() < MIN_SECTION_CHARS {
                continue;
            }

            let context = section_context(section, input.document_name);
            append_chunks(
                &mut chunks,
                input,
                &splitter,
                content,
                &context,
                Some(section.title.clone()),
                Some(section.level),
                section.parent_title.clone(),
            );
        }
        // A document whose sections were all below the floor still gets
        // indexed flat.
        if chunks.is_empty() {
            let base_context = format!("In document '{}':", input.document_name);
            append_chunks(
                &mut chunks,
                input,
                &splitter,
                input.text,
                &base_context,
                None,
                None,
                None,
            );
        }
    }

    debug!(
        document_id = %input.document_id,
        sections = input.sections.len(),
        chunks = chunks.len(),
        "hierarchical chunking finished"
    );
    Ok(chunks)
}

fn build_splitter(
    chunk_size: usize,
    chunk_overlap: usize,
) -> Result<TextSplitter<text_splitter::Characters>, AppError> {
    let config = ChunkConfig::new(chunk_size.max(1))
        .with_overlap(chunk_overlap)
        .map_err(|err| AppError::Validation(format!("invalid chunking config: {err}")))?;
    Ok(TextSplitter::new(config))
}

/// `"In document 'D', section 'P', subsection 'T':"` with absent levels
/// omitted.
fn section_context(section: &SectionInfo, document_name: &str) -> String {
    match &section.parent_title {
        Some(parent) => format!(
            "In document '{}', section '{}', subsection '{}':",
            document_name, parent, section.title
        ),
        None => format!(
            "In document '{}', section '{}':",
            document_name, section.title
        ),
    }
}

#[allow(clippy::too_many_arguments)]
fn append_chunks(
    chunks: &mut Vec<ChunkModel>,
    input: &ChunkerInput<'_>,
    splitter: &TextSplitter<text_splitter::Characters>,
    content: &str,
    context: &str,
    section_title: Option<String>,
    section_level: Option<u8>,
    parent_title: Option<String>,
) {
    for raw in splitter.chunks(content) {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let (entities, noun_chunks) = enrichment_for(raw, input.enrichment);
        let normalized_entities = normalize_entities(&entities);

        chunks.push(ChunkModel {
            chunk_id: Uuid::new_v4(),
            document_id: input.document_id,
            tenant_id: input.tenant_id,
            collection_id: input.collection_id.to_string(),
            agent_ids: input.agent_ids.to_vec(),
            chunk_index: chunks.len(),
            content: format!("{context}\n\n{raw}"),
            content_raw: raw.to_string(),
            section_title: section_title.clone(),
            section_level,
            section_context: context.to_string(),
            parent_title: parent_title.clone(),
            entities,
            noun_chunks,
            search_anchors: Vec::new(),
            atomic_facts: Vec::new(),
            fact_density: 0.5,
            normalized_entities,
            document_name: input.document_name.to_string(),
            document_type: input.document_type.as_str().to_string(),
            document_nature: input.document_type.document_nature().to_string(),
            language: input.enrichment.language.clone(),
            page_count: input.page_count,
            has_tables: raw.contains('|'),
            embedding: None,
            created_at: Utc::now(),
        });
    }
}

/// Document-level annotations filtered down to the surface forms that
/// actually occur in this chunk, case-insensitively.
fn enrichment_for(raw: &str, enrichment: &NlpEnrichment) -> (Vec<EntityRef>, Vec<String>) {
    let haystack = raw.to_lowercase();
    let entities = enrichment
        .entities
        .iter()
        .filter(|e| haystack.contains(&e.text.to_lowercase()))
        .map(|e| EntityRef {
            text: e.text.clone(),
            label: e.label.clone(),
        })
        .collect();
    let noun_chunks = enrichment
        .noun_chunks
        .iter()
        .filter(|nc| haystack.contains(&nc.to_lowercase()))
        .cloned()
        .collect();
    (entities, noun_chunks)
}

/// Maps annotation labels into the structured-filter schema; multi-valued
/// entries accumulate.
pub fn normalize_entities(entities: &[EntityRef]) -> HashMap<String, Vec<String>> {
    let mut normalized: HashMap<String, Vec<String>> = HashMap::new();
    for entity in entities {
        let label_lower = entity.label.to_lowercase();
        let key = match label_lower.as_str() {
            "per" | "person" => "person",
            "org" => "organization",
            "gpe" | "loc" => "location",
            "date" | "time" => "date",
            "money" => "amount",
            other => other,
        };
        let values = normalized.entry(key.to_string()).or_default();
        if !values.contains(&entity.text) {
            values.push(entity.text.clone());
        }
    }
    normalized
}
