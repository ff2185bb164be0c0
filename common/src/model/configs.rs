use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Sentinel collection id injected by config resolution when a tenant has no
/// ingested documents; downstream retrieval is skipped when it is present.
pub const NO_DOCUMENTS_SENTINEL: &str = "no_documents_available";

/// Settings owned by the execution service: history shaping and caching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionConfig {
    #[serde(default = "default_history_ttl")]
    pub history_ttl: u64,
    #[serde(default = "default_max_history_length")]
    pub max_history_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            history_ttl: default_history_ttl(),
            max_history_length: default_max_history_length(),
            timeout_secs: None,
        }
    }
}

fn default_history_ttl() -> u64 {
    3600
}

fn default_max_history_length() -> usize {
    20
}

/// Sampling and prompt settings forwarded verbatim to the LLM call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryConfig {
    pub model: String,
    pub system_prompt_template: String,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
    #[serde(default)]
    pub presence_penalty: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<usize>,
}

fn default_top_p() -> f32 {
    1.0
}

impl QueryConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.model.is_empty() {
            return Err(AppError::Validation("model is required".into()));
        }
        if self.system_prompt_template.is_empty() {
            return Err(AppError::Validation(
                "system_prompt_template is required".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(AppError::Validation(
                "temperature must be within [0, 1]".into(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(AppError::Validation("max_tokens must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(AppError::Validation("top_p must be within [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.frequency_penalty)
            || !(0.0..=1.0).contains(&self.presence_penalty)
        {
            return Err(AppError::Validation(
                "penalties must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Retrieval settings: which collections to search and how.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RagConfig {
    pub collection_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub document_ids: Vec<Uuid>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default)]
    pub fact_density_boost: f32,
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
    #[serde(default = "default_rag_max_retries")]
    pub max_retries: usize,
}

fn default_top_k() -> usize {
    5
}

fn default_similarity_threshold() -> f32 {
    0.0
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_max_text_length() -> usize {
    8192
}

fn default_rag_max_retries() -> usize {
    3
}

impl RagConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.collection_ids.is_empty() {
            return Err(AppError::Validation(
                "collection_ids must not be empty".into(),
            ));
        }
        if self.top_k == 0 {
            return Err(AppError::Validation("top_k must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(AppError::Validation(
                "similarity_threshold must be within [0, 1]".into(),
            ));
        }
        if self.embedding_model.is_empty() {
            return Err(AppError::Validation("embedding_model is required".into()));
        }
        Ok(())
    }

    /// True when retrieval should be skipped entirely.
    pub fn retrieval_disabled(&self) -> bool {
        self.collection_ids == [NO_DOCUMENTS_SENTINEL]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_config() -> QueryConfig {
        QueryConfig {
            model: "llama-3.3-70b-versatile".into(),
            system_prompt_template: "You are a helpful assistant.".into(),
            temperature: 0.7,
            max_tokens: 512,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stop: None,
            timeout_secs: None,
            max_retries: None,
        }
    }

    #[test]
    fn valid_query_config_passes() {
        assert!(query_config().validate().is_ok());
    }

    #[test]
    fn temperature_out_of_range_is_rejected() {
        let mut config = query_config();
        config.temperature = 1.5;
        assert!(matches!(
            config.validate(),
            Err(AppError::Validation(msg)) if msg.contains("temperature")
        ));
    }

    #[test]
    fn zero_max_tokens_is_rejected() {
        let mut config = query_config();
        config.max_tokens = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rag_config_requires_collections_and_top_k() {
        let config = RagConfig {
            collection_ids: vec![],
            document_ids: vec![],
            top_k: 5,
            similarity_threshold: 0.2,
            embedding_model: "text-embedding-3-small".into(),
            embedding_dimensions: 1536,
            fact_density_boost: 0.0,
            max_text_length: 8192,
            max_retries: 3,
        };
        assert!(config.validate().is_err());

        let mut with_collections = config.clone();
        with_collections.collection_ids = vec!["col_a".into()];
        assert!(with_collections.validate().is_ok());

        with_collections.top_k = 0;
        assert!(with_collections.validate().is_err());
    }

    #[test]
    fn sentinel_disables_retrieval() {
        let config = RagConfig {
            collection_ids: vec![NO_DOCUMENTS_SENTINEL.into()],
            document_ids: vec![],
            top_k: 5,
            similarity_threshold: 0.0,
            embedding_model: "text-embedding-3-small".into(),
            embedding_dimensions: 1536,
            fact_density_boost: 0.0,
            max_text_length: 8192,
            max_retries: 3,
        };
        assert!(config.retrieval_disabled());
    }
}
