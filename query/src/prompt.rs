use common::model::{ChatMessage, MessageRole};
use vector_index::SearchHit;

/// Renders retrieved chunks as a `Knowledge Chunks` block:
/// `[Source i: collection/document, Score: s]` followed by the chunk text.
pub fn build_context(hits: &[SearchHit], max_results: usize) -> String {
    hits.iter()
        .take(max_results)
        .enumerate()
        .map(|(i, hit)| {
            let mut source = format!("[Source {}: {}", i + 1, hit.collection_id);
            if let Some(document_id) = hit.document_id {
                source.push('/');
                source.push_str(&document_id.to_string());
            }
            source.push_str(&format!(", Score: {:.3}]", hit.score));
            format!("{source}\n{}", hit.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Installs the dynamic prompt as the sole system message: the configured
/// template, with the knowledge block appended when retrieval produced
/// chunks.
pub fn apply_system_prompt(
    messages: &[ChatMessage],
    template: &str,
    context: Option<&str>,
) -> Vec<ChatMessage> {
    let dynamic = match context.filter(|c| !c.is_empty()) {
        Some(context) => format!("{template}\n\nKnowledge Chunks:\n{context}"),
        None => template.to_string(),
    };

    let mut result = Vec::with_capacity(messages.len() + 1);
    result.push(ChatMessage::system(dynamic));
    result.extend(
        messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .cloned(),
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn hit(collection: &str, score: f32, content: &str) -> SearchHit {
        SearchHit {
            chunk_id: Uuid::new_v4(),
            document_id: Some(Uuid::new_v4()),
            collection_id: collection.to_string(),
            content: content.to_string(),
            score,
            fact_density: 0.5,
        }
    }

    #[test]
    fn context_lists_sources_with_scores() {
        let hits = vec![
            hit("col_a", 0.91234, "First chunk."),
            hit("col_b", 0.5, "Second chunk."),
        ];
        let context = build_context(&hits, 5);
        assert!(context.starts_with("[Source 1: col_a/"));
        assert!(context.contains("Score: 0.912]"));
        assert!(context.contains("[Source 2: col_b/"));
        assert!(context.contains("First chunk."));
        assert!(context.contains("Second chunk."));
    }

    #[test]
    fn context_respects_max_results() {
        let hits = vec![
            hit("col_a", 0.9, "one"),
            hit("col_a", 0.8, "two"),
            hit("col_a", 0.7, "three"),
        ];
        let context = build_context(&hits, 2);
        assert!(context.contains("one"));
        assert!(context.contains("two"));
        assert!(!context.contains("three"));
    }

    #[test]
    fn system_prompt_becomes_sole_system_message() {
        let messages = vec![
            ChatMessage::system("old instructions"),
            ChatMessage::user("question"),
            ChatMessage::system("more old instructions"),
        ];
        let result = apply_system_prompt(&messages, "Base prompt.", Some("chunks here"));
        let systems: Vec<_> = result
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .collect();
        assert_eq!(systems.len(), 1);
        assert!(systems[0].content.starts_with("Base prompt."));
        assert!(systems[0].content.contains("Knowledge Chunks:\nchunks here"));
        assert_eq!(result[0].role, MessageRole::System);
        assert_eq!(result[1].content, "question");
    }

    #[test]
    fn no_context_keeps_bare_template() {
        let result = apply_system_prompt(&[ChatMessage::user("hi")], "Base.", None);
        assert_eq!(result[0].content, "Base.");
        assert!(!result[0].content.contains("Knowledge Chunks"));
    }
}
